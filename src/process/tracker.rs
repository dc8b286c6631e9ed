//! Follows the observed process tree through fork/clone/exec/exit, either by
//! spawning a command under `PTRACE_TRACEME` or by attaching to a running
//! process.

use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use rustc_hash::FxHashMap;

use super::{get_process_comm, get_task_comm, get_threads};
use crate::types::{Process, Thread};

/// What the control plane wants to know about topology changes. Calls
/// arrive from the single tracker thread.
pub trait LifecycleObserver: Send {
    fn process_created(&self, parent: Option<Process>, process: Process, name: &str);
    fn thread_created(&self, process: Process, thread: Thread, name: &str);
    fn process_exec(&self, process: Process, name: &str);
    fn thread_exited(&self, thread: Thread);
}

#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error("ptrace operation failed: {0}")]
    Ptrace(Errno),
    #[error("could not launch '{command}': {errno}")]
    Launch { command: String, errno: Errno },
    #[error("the observed process was killed by signal {0}")]
    Killed(Signal),
}

const EXECERR_FOOTER: [u8; 4] = *b"NOEX";

/// A forked child that called `PTRACE_TRACEME` and now waits on the wake
/// pipe before it execs the target command.
pub struct SuspendedProcess {
    pid: Pid,
    resume_pipe: OwnedFd,
    execerr_pipe: OwnedFd,
}

impl SuspendedProcess {
    pub fn launch(command: &[OsString]) -> Result<SuspendedProcess, TracerError> {
        assert!(!command.is_empty());
        let argv: Vec<CString> = command
            .iter()
            .map(|arg| CString::new(arg.as_os_str().as_encoded_bytes().to_vec()).unwrap())
            .collect();
        let argv_ptrs: Vec<*const c_char> = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let (resume_read, resume_write) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(TracerError::Ptrace)?;
        let (execerr_read, execerr_write) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(TracerError::Ptrace)?;

        match unsafe { nix::unistd::fork() }.map_err(TracerError::Ptrace)? {
            nix::unistd::ForkResult::Child => {
                drop(resume_write);
                drop(execerr_read);
                Self::run_child(resume_read, execerr_write, &argv_ptrs)
            }
            nix::unistd::ForkResult::Parent { child } => {
                drop(resume_read);
                drop(execerr_write);
                Ok(SuspendedProcess {
                    pid: child,
                    resume_pipe: resume_write,
                    execerr_pipe: execerr_read,
                })
            }
        }
    }

    pub fn process(&self) -> Process {
        Process(self.pid.as_raw())
    }

    /// Wakes the child so it execs. Returns once the exec has happened (or
    /// reports why it didn't).
    pub fn resume(self, command_name: &OsStr) -> Result<(), TracerError> {
        nix::unistd::write(&self.resume_pipe, &[0x42]).map_err(TracerError::Ptrace)?;
        drop(self.resume_pipe);

        loop {
            let mut bytes = [0u8; 8];
            match nix::unistd::read(self.execerr_pipe.as_raw_fd(), &mut bytes) {
                // Pipe closed by the successful exec.
                Ok(0) => return Ok(()),
                Ok(8) => {
                    let (errno, footer) = bytes.split_at(4);
                    assert_eq!(footer, EXECERR_FOOTER, "garbled execerr message");
                    let errno =
                        Errno::from_raw(i32::from_be_bytes([errno[0], errno[1], errno[2], errno[3]]));
                    let _ = waitpid(self.pid, None);
                    return Err(TracerError::Launch {
                        command: command_name.to_string_lossy().into_owned(),
                        errno,
                    });
                }
                Ok(_) => {
                    let _ = waitpid(self.pid, None);
                    panic!("short read on the execerr pipe");
                }
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(TracerError::Ptrace(errno)),
            }
        }
    }

    fn run_child(
        resume_pipe: OwnedFd,
        execerr_pipe: OwnedFd,
        argv: &[*const c_char],
    ) -> ! {
        if ptrace::traceme().is_err() {
            unsafe { libc::_exit(1) }
        }

        // Wait for the tracker to be ready.
        loop {
            let mut buf = [0u8];
            match nix::unistd::read(resume_pipe.as_raw_fd(), &mut buf) {
                // Parent gave up; don't run the command.
                Ok(0) => std::process::exit(0),
                Ok(_) => break,
                Err(Errno::EINTR) => {}
                Err(_) => std::process::exit(1),
            }
        }

        unsafe {
            libc::execvp(argv[0], argv.as_ptr());
        }

        // exec failed; report errno through the pipe.
        let errno = Errno::last_raw().to_be_bytes();
        let bytes = [
            errno[0],
            errno[1],
            errno[2],
            errno[3],
            EXECERR_FOOTER[0],
            EXECERR_FOOTER[1],
            EXECERR_FOOTER[2],
            EXECERR_FOOTER[3],
        ];
        let _ = nix::unistd::write(&execerr_pipe, &bytes);
        unsafe { libc::_exit(1) }
    }
}

/// The ptrace loop. All tracer operations happen on the thread that runs
/// `run`, as the kernel requires for a tracer/tracee pair.
pub struct ProcessTracker {
    first_child: Process,
    attach_mode: bool,
    detach_requested: Arc<AtomicBool>,
    threads: FxHashMap<Thread, Process>,
    observer: Box<dyn LifecycleObserver>,
}

impl ProcessTracker {
    pub fn new(
        first_child: Process,
        attach_mode: bool,
        observer: Box<dyn LifecycleObserver>,
    ) -> ProcessTracker {
        let mut threads = FxHashMap::default();
        threads.insert(first_child.as_thread(), first_child);
        ProcessTracker {
            first_child,
            attach_mode,
            detach_requested: Arc::new(AtomicBool::new(false)),
            threads,
            observer,
        }
    }

    /// A flag the control plane flips on SIGINT in attach mode; the tracee
    /// additionally needs a SIGSTOP so the tracker wakes up and can detach.
    pub fn detach_flag(&self) -> Arc<AtomicBool> {
        self.detach_requested.clone()
    }

    /// Attaches to every task of the target process.
    pub fn attach(&mut self) -> Result<(), TracerError> {
        let process = self.first_child;
        let name = get_process_comm(process).unwrap_or_default();
        self.observer.process_created(None, process, &name);

        for thread in get_threads(process) {
            match ptrace::attach(Pid::from_raw(thread.as_raw())) {
                Ok(()) => {
                    self.threads.insert(thread, process);
                    if thread != process.as_thread() {
                        let comm = get_task_comm(process, thread).unwrap_or_default();
                        self.observer.thread_created(process, thread, &comm);
                    }
                }
                Err(Errno::ESRCH) => {
                    // Exited between the scan and the attach.
                    log::debug!("{thread} vanished before attach");
                }
                Err(errno) => return Err(TracerError::Ptrace(errno)),
            }
        }
        Ok(())
    }

    /// The wait loop. Returns the exit code of the first child, or 0 after
    /// a graceful detach.
    pub fn run(&mut self) -> Result<i32, TracerError> {
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // Everyone is gone; attach mode after detach ends here.
                    return Ok(0);
                }
                Err(errno) => return Err(TracerError::Ptrace(errno)),
            };

            if let Some(result) = self.handle_status(status)? {
                return Ok(result);
            }
        }
    }

    fn handle_status(&mut self, status: WaitStatus) -> Result<Option<i32>, TracerError> {
        match status {
            WaitStatus::Stopped(pid, Signal::SIGSTOP) => {
                let thread = Thread(pid.as_raw());
                if self.attach_mode && self.detach_requested.load(Ordering::SeqCst) {
                    self.detach_all();
                    return Ok(Some(0));
                }
                log::debug!("setting ptrace options for {thread}");
                self.set_options(pid);
                self.cont(pid, None);
            }
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                // A trap without a ptrace event: the post-exec stop of a
                // freshly spawned child.
                self.set_options(pid);
                self.cont(pid, None);
            }
            WaitStatus::Stopped(pid, signal) => {
                let thread = Thread(pid.as_raw());
                log::debug!("forwarding signal {signal} to {thread}");
                self.cont(pid, Some(signal));
            }
            WaitStatus::PtraceEvent(pid, _, event) => {
                self.handle_ptrace_event(pid, event);
                self.cont(pid, None);
            }
            WaitStatus::Exited(pid, code) => {
                let thread = Thread(pid.as_raw());
                self.threads.remove(&thread);
                if thread == self.first_child.as_thread() {
                    log::info!("first child exited with status {code}");
                    return Ok(Some(code));
                }
            }
            WaitStatus::Signaled(pid, signal, _) => {
                let thread = Thread(pid.as_raw());
                self.threads.remove(&thread);
                if thread == self.first_child.as_thread() {
                    return Err(TracerError::Killed(signal));
                }
            }
            other => {
                log::debug!("unhandled wait status {other:?}");
            }
        }
        Ok(None)
    }

    fn handle_ptrace_event(&mut self, pid: Pid, event: i32) {
        let thread = Thread(pid.as_raw());
        log::debug!("ptrace event stop for {thread}: {event}");
        match event {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                let Some(new_pid) = self.event_message(pid) else {
                    return;
                };
                let new_process = Process(new_pid as libc::pid_t);
                let parent = self.threads.get(&thread).copied();
                let command = get_process_comm(new_process).unwrap_or_default();
                log::debug!("new {new_process} ({command}) forked from {thread}");

                self.threads
                    .insert(new_process.as_thread(), new_process);
                self.observer.process_created(parent, new_process, &command);
            }
            libc::PTRACE_EVENT_CLONE => {
                let Some(new_tid) = self.event_message(pid) else {
                    return;
                };
                let new_thread = Thread(new_tid as libc::pid_t);
                // The clone may have happened in a thread; attribute the new
                // thread to the surrounding process.
                let Some(process) = self.threads.get(&thread).copied() else {
                    log::error!("clone from unknown {thread}");
                    return;
                };
                // Very short-lived threads can be gone already; that's fine.
                let command = get_task_comm(process, new_thread).unwrap_or_default();
                log::info!("new {new_thread} ({command}) cloned from {thread} in {process}");

                self.threads.insert(new_thread, process);
                self.observer.thread_created(process, new_thread, &command);
            }
            libc::PTRACE_EVENT_EXEC => {
                // Only for exec do we know the reporter is the main thread.
                let process = Process(pid.as_raw());
                let name = get_process_comm(process).unwrap_or_default();
                log::debug!("exec in {process} ({name})");
                self.observer.process_exec(process, &name);
            }
            libc::PTRACE_EVENT_EXIT => {
                log::info!("{thread} is about to exit");
                self.observer.thread_exited(thread);
            }
            other => {
                log::warn!("unhandled ptrace event for {thread}: {other}");
            }
        }
    }

    fn event_message(&self, pid: Pid) -> Option<u64> {
        match ptrace::getevent(pid) {
            Ok(message) => Some(message as u64),
            Err(Errno::ESRCH) => {
                log::debug!("thread {pid} exited concurrently");
                None
            }
            Err(errno) => {
                log::error!("PTRACE_GETEVENTMSG failed for {pid}: {errno}");
                None
            }
        }
    }

    fn set_options(&self, pid: Pid) {
        let options = ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEEXEC
            | ptrace::Options::PTRACE_O_TRACEEXIT;
        if let Err(errno) = ptrace::setoptions(pid, options) {
            if errno != Errno::ESRCH {
                log::warn!("PTRACE_SETOPTIONS failed for {pid}: {errno}");
            }
        }
    }

    fn cont(&self, pid: Pid, signal: Option<Signal>) {
        if let Err(errno) = ptrace::cont(pid, signal) {
            // Exited concurrently; the wait loop will pick it up.
            if errno != Errno::ESRCH {
                log::warn!("PTRACE_CONT failed for {pid}: {errno}");
            }
        }
    }

    fn detach_all(&mut self) {
        log::info!("detaching from {}", self.first_child);
        let threads: Vec<Thread> = self.threads.keys().copied().collect();
        for thread in threads {
            let pid = Pid::from_raw(thread.as_raw());
            if let Err(errno) = ptrace::detach(pid, None) {
                if errno != Errno::ESRCH {
                    log::warn!("PTRACE_DETACH failed for {thread}: {errno}");
                }
            }
        }
        self.threads.clear();
    }
}
