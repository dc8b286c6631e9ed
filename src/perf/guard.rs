use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

use super::sys::*;

/// An open perf event fd. Closes on drop.
#[derive(Debug)]
pub struct EventGuard {
    fd: OwnedFd,
}

impl EventGuard {
    pub fn from_raw(fd: RawFd) -> EventGuard {
        EventGuard {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn enable(&self) -> Result<(), Errno> {
        self.ioctl(PERF_EVENT_IOC_ENABLE, 0)
    }

    pub fn disable(&self) -> Result<(), Errno> {
        self.ioctl(PERF_EVENT_IOC_DISABLE, 0)
    }

    pub fn reset(&self) -> Result<(), Errno> {
        self.ioctl(PERF_EVENT_IOC_RESET, 0)
    }

    /// Redirects this event's samples into `other`'s ring buffer.
    pub fn set_output(&self, other: &EventGuard) -> Result<(), Errno> {
        self.ioctl(PERF_EVENT_IOC_SET_OUTPUT, other.fd() as libc::c_ulong)
    }

    /// Restricts a `raw_syscalls:sys_enter`/`sys_exit` tracepoint to the
    /// given syscall numbers.
    pub fn set_syscall_filter(&self, syscalls: &[i64]) -> Result<(), Errno> {
        if syscalls.is_empty() {
            return Ok(());
        }
        let filter = syscalls
            .iter()
            .map(|nr| format!("id == {nr}"))
            .collect::<Vec<_>>()
            .join(" || ");
        let filter = CString::new(filter).map_err(|_| Errno::EINVAL)?;
        let res = unsafe {
            libc::ioctl(
                self.fd(),
                PERF_EVENT_IOC_SET_FILTER as _,
                filter.as_ptr(),
            )
        };
        if res == -1 {
            return Err(Errno::last());
        }
        Ok(())
    }

    /// The kernel-assigned event id, used to tell group members apart in
    /// `PERF_FORMAT_GROUP` reads.
    pub fn id(&self) -> Result<u64, Errno> {
        let mut id: u64 = 0;
        let res = unsafe { libc::ioctl(self.fd(), PERF_EVENT_IOC_ID as _, &mut id) };
        if res == -1 {
            return Err(Errno::last());
        }
        Ok(id)
    }

    /// Reads one plain-old-data value, e.g. a counter.
    pub fn read_value<T: Copy>(&self) -> Result<T, Errno> {
        let mut value = MaybeUninit::<T>::uninit();
        let size = std::mem::size_of::<T>();
        let res = unsafe { libc::read(self.fd(), value.as_mut_ptr() as *mut libc::c_void, size) };
        if res < 0 {
            return Err(Errno::last());
        }
        if res as usize != size {
            return Err(Errno::EIO);
        }
        Ok(unsafe { value.assume_init() })
    }

    /// Reads a variable-length group read-format into `buf`, returning the
    /// number of `u64` words filled.
    pub fn read_group(&self, buf: &mut [u64]) -> Result<usize, Errno> {
        let res = unsafe {
            libc::read(
                self.fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                std::mem::size_of_val(buf),
            )
        };
        if res < 0 {
            return Err(Errno::last());
        }
        Ok(res as usize / std::mem::size_of::<u64>())
    }

    pub fn set_nonblocking(&self) -> Result<(), Errno> {
        let res = unsafe { libc::fcntl(self.fd(), libc::F_SETFL, libc::O_NONBLOCK) };
        if res == -1 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn ioctl(&self, request: libc::c_ulong, arg: libc::c_ulong) -> Result<(), Errno> {
        let res = unsafe { libc::ioctl(self.fd(), request as _, arg) };
        if res == -1 {
            return Err(Errno::last());
        }
        Ok(())
    }
}
