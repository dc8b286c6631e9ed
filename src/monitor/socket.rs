//! The control socket: agents (GPU tracers, OpenMP runtimes) connect to a
//! `SOCK_SEQPACKET` socket, send a measurement-type tag and pass the fd of
//! a shared-memory ring buffer via `SCM_RIGHTS`. Each accepted ring gets
//! its own monitor thread.

use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::socket::{
    accept, bind, listen, recvmsg, socket, AddressFamily, Backlog, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};

use super::{MonitorHandle, PollSet};
use crate::cctx::{CallingContext, LocalCctxTree, OmpType};
use crate::clock;
use crate::ipc::{IpcRecord, MeasurementType, OmpContextKind, RingReader, ShmRing};
use crate::otf2::Event;
use crate::trace::Trace;
use crate::types::{MeasurementScope, Process, Thread};

pub struct SocketMonitor {
    trace: Arc<Trace>,
    socket: OwnedFd,
    path: PathBuf,
    agents: Vec<MonitorHandle>,
    next_agent: i32,
}

impl SocketMonitor {
    pub fn create(trace: Arc<Trace>, path: &Path) -> nix::Result<SocketMonitor> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;

        // A stale socket file from a previous run would make bind fail.
        let _ = std::fs::remove_file(path);
        let addr = UnixAddr::new(path)?;
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(20)?)?;

        Ok(SocketMonitor {
            trace,
            socket: fd,
            path: path.to_owned(),
            agents: Vec::new(),
            next_agent: 0,
        })
    }

    pub fn spawn(self) -> MonitorHandle {
        super::spawn("control socket", move |stop| self.run(stop))
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        let mut poll = PollSet::new();
        poll.add_fd(self.socket.as_raw_fd());

        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let outcome = poll.poll();
            if !outcome.ready {
                continue;
            }
            match accept(self.socket.as_raw_fd()) {
                Ok(connection) => {
                    let connection = unsafe { OwnedFd::from_raw_fd(connection) };
                    self.handle_connection(connection);
                }
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {}
                Err(errno) => {
                    log::error!("accept on the control socket failed: {errno}");
                    break;
                }
            }
        }

        for agent in self.agents.drain(..) {
            agent.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }

    fn handle_connection(&mut self, connection: OwnedFd) {
        let (measurement_type, ring_fd) = match receive_ring_fd(connection.as_raw_fd()) {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("rejecting control socket connection: {err}");
                return;
            }
        };

        let ring = match ShmRing::open(ring_fd) {
            Ok(ring) => ring,
            Err(err) => {
                log::warn!("cannot map agent ring buffer: {err}");
                return;
            }
        };
        let reader = RingReader::new(ring);

        let agent_id = self.next_agent;
        self.next_agent += 1;
        let handle = match measurement_type {
            MeasurementType::Gpu => {
                GpuMonitor::create(self.trace.clone(), reader, agent_id).map(GpuMonitor::spawn)
            }
            MeasurementType::OpenMp => {
                OmpMonitor::create(self.trace.clone(), reader, agent_id).map(OmpMonitor::spawn)
            }
        };
        match handle {
            Ok(handle) => self.agents.push(handle),
            Err(err) => log::error!("failed to start agent monitor: {err}"),
        }
    }
}

/// Reads the 8-byte measurement-type tag plus the attached ring fd.
fn receive_ring_fd(connection: RawFd) -> Result<(MeasurementType, OwnedFd), String> {
    let mut tag_bytes = [0u8; 8];
    let mut iov = [IoSliceMut::new(&mut tag_bytes)];
    let mut cmsg_buffer = nix::cmsg_space!(RawFd);

    let msg = recvmsg::<()>(connection, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .map_err(|errno| format!("recvmsg failed: {errno}"))?;

    let mut received_fd = None;
    for cmsg in msg.cmsgs().map_err(|errno| format!("cmsgs failed: {errno}"))? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                received_fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    let fd = received_fd.ok_or_else(|| "no fd attached to the connection".to_owned())?;

    let tag = u64::from_ne_bytes(tag_bytes);
    let measurement_type = MeasurementType::from_tag(tag)
        .ok_or_else(|| format!("unknown measurement type tag {tag}"))?;
    Ok((measurement_type, fd))
}

/// Replays GPU kernel records from an agent ring as calling-context
/// enter/leave pairs. Timestamps are already local.
pub struct GpuMonitor {
    trace: Arc<Trace>,
    reader: RingReader,
    tree: LocalCctxTree,
    agent: Process,
}

impl GpuMonitor {
    fn create(trace: Arc<Trace>, reader: RingReader, agent_id: i32) -> std::io::Result<GpuMonitor> {
        let agent = Process(agent_id);
        let tree = trace.create_local_cctx_tree(MeasurementScope::gpu(agent))?;
        Ok(GpuMonitor {
            trace,
            reader,
            tree,
            agent,
        })
    }

    fn spawn(self) -> MonitorHandle {
        let name = format!("gpu agent {}", self.agent.as_raw());
        super::spawn(&name, move |stop| self.run(stop))
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        let comm = self.trace.hardware_comm();
        self.tree.writer().write(Event::ThreadBegin {
            time: clock::now(),
            comm,
        });

        loop {
            let mut drained_any = false;
            while let Some(record) = self.reader.read_record() {
                drained_any = true;
                match record {
                    IpcRecord::KernelDef { id, name } => {
                        self.trace.register_gpu_kernel(id, &name);
                    }
                    IpcRecord::Kernel { start, end, id } => {
                        let level = self
                            .tree
                            .cctx_enter(start, &[CallingContext::GpuKernel(id)]);
                        self.tree.cctx_leave(end, level);
                    }
                    other => {
                        log::debug!("unexpected record on gpu ring: {other:?}");
                    }
                }
            }
            if stop.load(Ordering::SeqCst) && !drained_any {
                break;
            }
            std::thread::sleep(super::POLL_TIMEOUT);
        }

        let now = clock::now();
        self.tree.finalize(now);
        self.tree.writer().write(Event::ThreadEnd { time: now, comm });
        self.trace.submit_local_tree(self.tree);
    }
}

fn omp_type(kind: OmpContextKind) -> OmpType {
    match kind {
        OmpContextKind::Parallel => OmpType::Parallel,
        OmpContextKind::Sync => OmpType::Sync,
        OmpContextKind::Task => OmpType::Task,
        OmpContextKind::Loop => OmpType::Loop,
        OmpContextKind::Other => OmpType::Other,
    }
}

/// Replays OpenMP scope records from an agent ring.
pub struct OmpMonitor {
    trace: Arc<Trace>,
    reader: RingReader,
    tree: LocalCctxTree,
    agent: Thread,
}

impl OmpMonitor {
    fn create(trace: Arc<Trace>, reader: RingReader, agent_id: i32) -> std::io::Result<OmpMonitor> {
        let agent = Thread(agent_id);
        let tree = trace.create_local_cctx_tree(MeasurementScope::openmp(agent))?;
        Ok(OmpMonitor {
            trace,
            reader,
            tree,
            agent,
        })
    }

    fn spawn(self) -> MonitorHandle {
        let name = format!("omp agent {}", self.agent.as_raw());
        super::spawn(&name, move |stop| self.run(stop))
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        let comm = self.trace.hardware_comm();
        self.tree.writer().write(Event::ThreadBegin {
            time: clock::now(),
            comm,
        });

        loop {
            let mut drained_any = false;
            while let Some(record) = self.reader.read_record() {
                drained_any = true;
                match record {
                    IpcRecord::OmpEnter { time, ctx } => {
                        let node = CallingContext::OpenMp {
                            kind: omp_type(ctx.kind),
                            addr: crate::address::Address(ctx.addr),
                            thread: Thread(ctx.thread),
                            num_threads: (ctx.num_threads > 0).then_some(ctx.num_threads),
                        };
                        self.tree.cctx_enter(time, &[node]);
                    }
                    IpcRecord::OmpLeave { time, .. } => {
                        self.tree.cctx_leave_top(time);
                    }
                    other => {
                        log::debug!("unexpected record on omp ring: {other:?}");
                    }
                }
            }
            if stop.load(Ordering::SeqCst) && !drained_any {
                break;
            }
            std::thread::sleep(super::POLL_TIMEOUT);
        }

        let now = clock::now();
        self.tree.finalize(now);
        self.tree.writer().write(Event::ThreadEnd { time: now, comm });
        self.trace.submit_local_tree(self.tree);
    }
}
