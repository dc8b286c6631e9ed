//! Monitor loops: per-scope threads that own event sources, a local writer
//! and a poll loop, plus the two control planes that wire everything up.

pub mod bio;
pub mod counters;
pub mod cpu_set;
pub mod posix_io;
pub mod process;
pub mod sample;
pub mod socket;
pub mod syscall;
pub mod tracepoint;

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

/// How long one poll iteration may block; bounds the cancellation latency.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// A running monitor thread with its cooperative stop flag.
pub struct MonitorHandle {
    name: String,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(self) {
        self.request_stop();
        log::debug!("joining monitor {}", self.name);
        if self.thread.join().is_err() {
            log::error!("monitor {} panicked", self.name);
        }
    }
}

/// Spawns a named monitor thread. The closure receives the stop flag it
/// must poll every iteration.
pub fn spawn(name: &str, body: impl FnOnce(Arc<AtomicBool>) + Send + 'static) -> MonitorHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    let thread_name = name.to_owned();
    let thread = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || body(stop_for_thread))
        .expect("failed to spawn monitor thread");
    MonitorHandle {
        name: thread_name,
        stop,
        thread,
    }
}

/// The poll set of one monitor: its event fds plus a timer driving periodic
/// counter reads.
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    timer: Option<TimerFd>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub timer_expired: bool,
    pub ready: bool,
}

impl PollSet {
    pub fn new() -> PollSet {
        PollSet {
            fds: Vec::new(),
            timer: None,
        }
    }

    pub fn add_fd(&mut self, fd: RawFd) {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }

    /// Installs a periodic timer. Readings happen on its cadence rather
    /// than on ring-buffer watermarks.
    pub fn set_interval(&mut self, interval: Duration) -> std::io::Result<()> {
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_CLOEXEC)?;
        timer.set(
            Expiration::Interval(TimeSpec::from_duration(interval)),
            TimerSetTimeFlags::empty(),
        )?;
        self.add_fd(timer.as_fd().as_raw_fd());
        self.timer = Some(timer);
        Ok(())
    }

    /// One bounded wait. Returns which kind of wakeup happened.
    pub fn poll(&mut self) -> PollOutcome {
        for fd in &mut self.fds {
            fd.revents = 0;
        }
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                POLL_TIMEOUT.as_millis() as i32,
            )
        };
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                log::error!("poll failed: {err}");
            }
            return PollOutcome {
                timer_expired: false,
                ready: false,
            };
        }

        let mut timer_expired = false;
        if let Some(timer) = &self.timer {
            let timer_fd = timer.as_fd().as_raw_fd();
            if self
                .fds
                .iter()
                .any(|fd| fd.fd == timer_fd && fd.revents & libc::POLLIN != 0)
            {
                // Consume the expiration count so the fd goes quiet again.
                let _ = timer.wait();
                timer_expired = true;
            }
        }

        PollOutcome {
            timer_expired,
            ready: ret > 0,
        }
    }
}

impl Default for PollSet {
    fn default() -> Self {
        Self::new()
    }
}
