//! POSIX I/O recording through an eBPF program attached to the
//! open/close/read/write syscall tracepoints. The program filters on a
//! thread map the monitor maintains and streams events through a BPF ring
//! buffer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aya::maps::{HashMap as BpfHashMap, MapData, RingBuf};
use aya::programs::TracePoint;
use byteorder::{ByteOrder, NativeEndian};
use crossbeam_channel::Receiver;
use rustc_hash::FxHashMap;

use super::MonitorHandle;
use crate::clock::{self, ClockConverter};
use crate::config::Config;
use crate::otf2::{Event, EventWriter, IoOperationMode, LocationType};
use crate::trace::Trace;
use crate::types::{MeasurementScope, Thread};

/// Thread membership changes, fed by the lifecycle tracker.
#[derive(Debug, Clone, Copy)]
pub enum ThreadEvent {
    Insert(Thread),
    Remove(Thread),
}

const EVENT_OPEN: u32 = 0;
const EVENT_CLOSE: u32 = 1;
const EVENT_READ_ENTER: u32 = 2;
const EVENT_READ_EXIT: u32 = 3;
const EVENT_WRITE_ENTER: u32 = 4;
const EVENT_WRITE_EXIT: u32 = 5;

/// The fixed part of one event record from the BPF side.
struct PosixEvent {
    event_type: u32,
    pid: i32,
    fd: i32,
    time: u64,
    count: u64,
    buf: u64,
    filename: String,
}

fn parse_event(bytes: &[u8]) -> Option<PosixEvent> {
    if bytes.len() < 40 {
        return None;
    }
    let filename_bytes = &bytes[40..];
    let nul = memchr::memchr(0, filename_bytes).unwrap_or(filename_bytes.len());
    Some(PosixEvent {
        event_type: NativeEndian::read_u32(&bytes[0..4]),
        pid: NativeEndian::read_i32(&bytes[4..8]),
        fd: NativeEndian::read_i32(&bytes[8..12]),
        time: NativeEndian::read_u64(&bytes[16..24]),
        count: NativeEndian::read_u64(&bytes[24..32]),
        buf: NativeEndian::read_u64(&bytes[32..40]),
        filename: String::from_utf8_lossy(&filename_bytes[..nul]).into_owned(),
    })
}

struct ThreadWriter {
    writer: EventWriter,
    comm: crate::otf2::CommRef,
}

pub struct PosixIoMonitor {
    trace: Arc<Trace>,
    converter: ClockConverter,
    _ebpf: aya::Ebpf,
    ring: RingBuf<MapData>,
    pids: BpfHashMap<MapData, u32, u8>,
    thread_events: Receiver<ThreadEvent>,
    writers: FxHashMap<Thread, ThreadWriter>,
    /// Reuse generation per (thread, fd); bumped on every open of the same
    /// fd number so `{tid, fd, generation}` maps to one file.
    instances: FxHashMap<(i32, i32), u64>,
    filenames: FxHashMap<(i32, i32), String>,
    /// The in-flight read/write per thread; sys_exit carries neither fd nor
    /// buffer, so they are cached at entry.
    in_flight: FxHashMap<Thread, (i32, u64, u64, bool)>,
}

impl PosixIoMonitor {
    /// Loads and attaches the BPF program. Failure is not fatal for the
    /// measurement; the caller logs and continues without POSIX I/O.
    pub fn create(
        trace: Arc<Trace>,
        converter: ClockConverter,
        config: &Config,
        thread_events: Receiver<ThreadEvent>,
    ) -> Result<PosixIoMonitor, String> {
        let object = config
            .posix_io_bpf_object
            .clone()
            .or_else(|| std::env::var_os("OTTER_POSIX_IO_BPF").map(PathBuf::from))
            .ok_or_else(|| "no POSIX I/O BPF object configured".to_owned())?;

        // Anything beyond a trivial BPF program needs a higher memlock
        // rlimit on pre-5.11 kernels.
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } != 0 {
            log::warn!("could not raise the memlock rlimit, BPF loading may fail");
        }

        let mut ebpf = aya::Ebpf::load_file(&object).map_err(|err| err.to_string())?;

        for (program, category, name) in [
            ("otter_sys_enter_openat", "syscalls", "sys_enter_openat"),
            ("otter_sys_exit_openat", "syscalls", "sys_exit_openat"),
            ("otter_sys_enter_close", "syscalls", "sys_enter_close"),
            ("otter_sys_enter_read", "syscalls", "sys_enter_read"),
            ("otter_sys_exit_read", "syscalls", "sys_exit_read"),
            ("otter_sys_enter_write", "syscalls", "sys_enter_write"),
            ("otter_sys_exit_write", "syscalls", "sys_exit_write"),
        ] {
            let tracepoint: &mut TracePoint = ebpf
                .program_mut(program)
                .ok_or_else(|| format!("BPF object has no program '{program}'"))?
                .try_into()
                .map_err(|err: aya::programs::ProgramError| err.to_string())?;
            tracepoint.load().map_err(|err| err.to_string())?;
            tracepoint
                .attach(category, name)
                .map_err(|err| err.to_string())?;
        }

        let ring = RingBuf::try_from(
            ebpf.take_map("EVENTS")
                .ok_or_else(|| "BPF object has no ring buffer map 'EVENTS'".to_owned())?,
        )
        .map_err(|err| err.to_string())?;
        let pids = BpfHashMap::try_from(
            ebpf.take_map("PIDS")
                .ok_or_else(|| "BPF object has no thread filter map 'PIDS'".to_owned())?,
        )
        .map_err(|err| err.to_string())?;

        Ok(PosixIoMonitor {
            trace,
            converter,
            _ebpf: ebpf,
            ring,
            pids,
            thread_events,
            writers: FxHashMap::default(),
            instances: FxHashMap::default(),
            filenames: FxHashMap::default(),
            in_flight: FxHashMap::default(),
        })
    }

    pub fn spawn(self) -> MonitorHandle {
        super::spawn("posix i/o", move |stop| self.run(stop))
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            self.apply_thread_events();
            self.drain();
            // The ring is drained on a fixed cadence; event latency is
            // bounded by it.
            std::thread::sleep(super::POLL_TIMEOUT);
        }
        self.drain();

        for (_, thread_writer) in self.writers.drain() {
            let mut writer = thread_writer.writer;
            writer.write(Event::ThreadEnd {
                time: clock::now(),
                comm: thread_writer.comm,
            });
            writer.finish();
        }
    }

    fn apply_thread_events(&mut self) {
        while let Ok(event) = self.thread_events.try_recv() {
            match event {
                ThreadEvent::Insert(thread) => {
                    if let Err(err) = self.pids.insert(thread.as_raw() as u32, 1, 0) {
                        log::debug!("failed to add {thread} to the BPF filter: {err}");
                    }
                }
                ThreadEvent::Remove(thread) => {
                    let _ = self.pids.remove(&(thread.as_raw() as u32));
                }
            }
        }
    }

    fn drain(&mut self) {
        loop {
            let event = match self.ring.next() {
                Some(item) => parse_event(&item),
                None => break,
            };
            if let Some(event) = event {
                self.handle_event(&event);
            }
        }
    }

    fn writer_for(&mut self, thread: Thread) -> Option<&mut ThreadWriter> {
        if !self.writers.contains_key(&thread) {
            let writer = self
                .trace
                .create_writer(MeasurementScope::posix_io(thread), LocationType::IoDevice)
                .ok()?;
            let comm = self.trace.process_comm(thread);
            let mut thread_writer = ThreadWriter { writer, comm };
            thread_writer.writer.write(Event::ThreadBegin {
                time: clock::now(),
                comm,
            });
            self.writers.insert(thread, thread_writer);
        }
        self.writers.get_mut(&thread)
    }

    fn handle_event(&mut self, event: &PosixEvent) {
        let thread = Thread(event.pid);
        let time = self.converter.convert(event.time);

        let filename = match event.fd {
            0 => "stdin".to_owned(),
            1 => "stdout".to_owned(),
            2 => "stderr".to_owned(),
            _ => event.filename.clone(),
        };

        match event.event_type {
            EVENT_OPEN => {
                let key = (event.pid, event.fd);
                let instance = match self.instances.get(&key) {
                    // The fd number is being reused for another file.
                    Some(&previous) => previous + 1,
                    None => 0,
                };
                self.instances.insert(key, instance);
                self.filenames.insert(key, filename.clone());

                let Some(handle) =
                    self.trace
                        .posix_io_handle(thread, event.fd, instance, &filename)
                else {
                    return;
                };
                if let Some(w) = self.writer_for(thread) {
                    let time = w.writer.adjust_time(time);
                    w.writer.write(Event::IoCreateHandle { time, handle });
                }
            }
            EVENT_CLOSE => {
                let key = (event.pid, event.fd);
                let instance = self.instances.get(&key).copied().unwrap_or(0);
                let name = self
                    .filenames
                    .get(&key)
                    .cloned()
                    .unwrap_or(filename);
                let Some(handle) = self.trace.posix_io_handle(thread, event.fd, instance, &name)
                else {
                    return;
                };
                if let Some(w) = self.writer_for(thread) {
                    let time = w.writer.adjust_time(time);
                    w.writer.write(Event::IoDestroyHandle { time, handle });
                }
            }
            EVENT_READ_ENTER | EVENT_WRITE_ENTER => {
                let is_write = event.event_type == EVENT_WRITE_ENTER;
                // A thread is in at most one read/write at a time; the exit
                // event only carries the result.
                self.in_flight
                    .insert(thread, (event.fd, event.count, event.buf, is_write));

                let key = (event.pid, event.fd);
                let instance = self.instances.get(&key).copied().unwrap_or(0);
                let name = self.filenames.get(&key).cloned().unwrap_or(filename);
                let Some(handle) = self.trace.posix_io_handle(thread, event.fd, instance, &name)
                else {
                    return;
                };
                if let Some(w) = self.writer_for(thread) {
                    let time = w.writer.adjust_time(time);
                    w.writer.write(Event::IoOperationBegin {
                        time,
                        handle,
                        mode: if is_write {
                            IoOperationMode::Write
                        } else {
                            IoOperationMode::Read
                        },
                        bytes: event.count,
                        // The buffer address is unique among in-flight
                        // operations.
                        matching_id: event.buf,
                    });
                }
            }
            EVENT_READ_EXIT | EVENT_WRITE_EXIT => {
                let Some((fd, count, buf, _)) = self.in_flight.remove(&thread) else {
                    return;
                };
                let key = (event.pid, fd);
                let instance = self.instances.get(&key).copied().unwrap_or(0);
                let name = self.filenames.get(&key).cloned().unwrap_or_default();
                let Some(handle) = self.trace.posix_io_handle(thread, fd, instance, &name) else {
                    return;
                };
                if let Some(w) = self.writer_for(thread) {
                    let time = w.writer.adjust_time(time);
                    w.writer.write(Event::IoOperationComplete {
                        time,
                        handle,
                        bytes: count,
                        matching_id: buf,
                    });
                }
            }
            other => {
                log::debug!("unknown posix i/o event type {other}");
            }
        }
    }
}
