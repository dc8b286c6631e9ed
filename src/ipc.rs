//! Shared-memory ring buffers for out-of-process event injection from GPU
//! and OpenMP agents.
//!
//! The region is a header page with version and `{head, tail, size}`
//! cursors, followed by a power-of-two data area that is mapped twice
//! back-to-back in virtual memory. A record crossing the wrap therefore
//! appears contiguous to both sides; no scratch copies are needed.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, NativeEndian};

use crate::otf2::Timestamp;

const RINGBUF_VERSION: u64 = 1;

/// The first 8-byte payload received on the control socket, identifying
/// what kind of agent sits on the other side of the passed fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementType {
    Gpu,
    OpenMp,
}

impl MeasurementType {
    pub fn from_tag(tag: u64) -> Option<MeasurementType> {
        match tag {
            1 => Some(MeasurementType::Gpu),
            2 => Some(MeasurementType::OpenMp),
            _ => None,
        }
    }

    pub fn tag(self) -> u64 {
        match self {
            MeasurementType::Gpu => 1,
            MeasurementType::OpenMp => 2,
        }
    }
}

#[repr(C)]
struct RingbufHeader {
    version: u64,
    size: u64,
    head: AtomicU64,
    tail: AtomicU64,
}

/// The mapped region shared by producer and consumer.
pub struct ShmRing {
    first_map: *mut u8,
    first_len: usize,
    data: *mut u8,
    size: u64,
    fd: OwnedFd,
    unlink_name: Option<String>,
}

unsafe impl Send for ShmRing {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl ShmRing {
    /// Creates a fresh ring of `pages` data pages over `fd` and initializes
    /// the header.
    pub fn create(fd: OwnedFd, pages: usize) -> io::Result<ShmRing> {
        assert!(pages > 0 && pages.is_power_of_two());
        let page = page_size();
        let size = pages * page;
        nix::unistd::ftruncate(fd.as_fd(), (size + page) as libc::off_t)
            .map_err(io::Error::from)?;

        let ring = Self::map(fd, size as u64)?;
        unsafe {
            let header = ring.header();
            (*header).version = RINGBUF_VERSION;
            (*header).size = size as u64;
            (*header).head.store(0, Ordering::Release);
            (*header).tail.store(0, Ordering::Release);
        }
        Ok(ring)
    }

    /// Opens a ring somebody else created, e.g. one received over the
    /// control socket.
    pub fn open(fd: OwnedFd) -> io::Result<ShmRing> {
        let page = page_size();

        // Peek at the header to learn the data size.
        let probe = unsafe {
            libc::mmap(
                ptr::null_mut(),
                page,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if probe == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let (version, size) = unsafe {
            let header = probe as *const RingbufHeader;
            ((*header).version, (*header).size)
        };
        unsafe {
            libc::munmap(probe, page);
        }

        if version != RINGBUF_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("incompatible ring buffer version {version} on the other side"),
            ));
        }

        Self::map(fd, size)
    }

    /// Maps header + data, with the data region mapped twice consecutively.
    ///
    /// There is no way to reserve virtual address space portably, so map a
    /// region of twice the data size first and then overwrite its latter
    /// half with a `MAP_FIXED` mapping of the data pages. Only mappings we
    /// own are touched that way.
    fn map(fd: OwnedFd, size: u64) -> io::Result<ShmRing> {
        let page = page_size();
        let first_len = 2 * size as usize + page;
        let first_map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                first_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if first_map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let first_map = first_map as *mut u8;

        let second_target = unsafe { first_map.add(page + size as usize) };
        let second_map = unsafe {
            libc::mmap(
                second_target as *mut libc::c_void,
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd.as_raw_fd(),
                page as libc::off_t,
            )
        };
        if second_map == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(first_map as *mut libc::c_void, first_len);
            }
            return Err(err);
        }

        Ok(ShmRing {
            first_map,
            first_len,
            data: unsafe { first_map.add(page) },
            size,
            fd,
            unlink_name: None,
        })
    }

    fn header(&self) -> *mut RingbufHeader {
        self.first_map as *mut RingbufHeader
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn head(&self) -> u64 {
        unsafe { (*self.header()).head.load(Ordering::Acquire) }
    }

    fn tail(&self) -> u64 {
        unsafe { (*self.header()).tail.load(Ordering::Acquire) }
    }

    fn set_head(&self, head: u64) {
        unsafe { (*self.header()).head.store(head, Ordering::Release) }
    }

    fn set_tail(&self, tail: u64) {
        unsafe { (*self.header()).tail.store(tail, Ordering::Release) }
    }

    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }
}

impl Drop for ShmRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.first_map as *mut libc::c_void, self.first_len);
        }
        if let Some(name) = &self.unlink_name {
            let _ = nix::sys::mman::shm_unlink(name.as_str());
        }
    }
}

/// A name like `/otter-gpu-1234`, shared with the agent on the other side.
pub fn shm_ring_name(component: &str, pid: libc::pid_t) -> String {
    format!("/otter-{component}-{pid}")
}

/// Creates a named shm ring; the name is unlinked when the ring is dropped.
pub fn create_named_ring(component: &str, pid: libc::pid_t, pages: usize) -> io::Result<ShmRing> {
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;

    let name = shm_ring_name(component, pid);
    let fd = nix::sys::mman::shm_open(
        name.as_str(),
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .map_err(io::Error::from)?;
    let mut ring = ShmRing::create(fd, pages)?;
    ring.unlink_name = Some(name);
    Ok(ring)
}

/// Producer half. Only one side may produce.
pub struct RingWriter {
    ring: ShmRing,
    reserved: u64,
}

impl RingWriter {
    pub fn new(ring: ShmRing) -> RingWriter {
        RingWriter { ring, reserved: 0 }
    }

    /// Reserves `len` bytes at the head, or `None` when there is not enough
    /// free space; the producer must drop the record or retry later.
    pub fn reserve(&mut self, len: u64) -> Option<&mut [u8]> {
        if len == 0 {
            return None;
        }
        assert_eq!(self.reserved, 0, "a reservation is already active");

        let head = self.ring.head();
        let tail = self.ring.tail();
        let size = self.ring.size();
        // One byte stays unused so a full ring is distinguishable from an
        // empty one.
        let free = if head >= tail {
            size - (head - tail)
        } else {
            tail - head
        };
        if len >= free {
            return None;
        }

        self.reserved = len;
        let start = unsafe { self.ring.data.add(head as usize) };
        Some(unsafe { std::slice::from_raw_parts_mut(start, len as usize) })
    }

    pub fn commit(&mut self) {
        assert_ne!(self.reserved, 0, "commit without reservation");
        let head = (self.ring.head() + self.reserved) % self.ring.size();
        self.ring.set_head(head);
        self.reserved = 0;
    }

    pub fn write_record(&mut self, record: &IpcRecord) -> bool {
        let encoded = record.encode();
        match self.reserve(encoded.len() as u64) {
            Some(buf) => {
                buf.copy_from_slice(&encoded);
                self.commit();
                true
            }
            None => false,
        }
    }
}

/// Consumer half.
pub struct RingReader {
    ring: ShmRing,
}

impl RingReader {
    pub fn new(ring: ShmRing) -> RingReader {
        RingReader { ring }
    }

    fn available(&self) -> u64 {
        let head = self.ring.head();
        let tail = self.ring.tail();
        if tail <= head {
            head - tail
        } else {
            head + self.ring.size() - tail
        }
    }

    /// A view of the next `len` bytes, contiguous thanks to the double
    /// mapping, or `None` if fewer are available.
    pub fn peek(&self, len: u64) -> Option<&[u8]> {
        if len == 0 || self.available() < len {
            return None;
        }
        let tail = self.ring.tail();
        let start = unsafe { self.ring.data.add(tail as usize) };
        Some(unsafe { std::slice::from_raw_parts(start, len as usize) })
    }

    pub fn pop(&mut self, len: u64) {
        if len == 0 {
            return;
        }
        assert!(self.available() >= len, "pop past the head");
        self.ring.set_tail((self.ring.tail() + len) % self.ring.size());
    }

    /// Decodes and consumes the next record, if a complete one is present.
    pub fn read_record(&mut self) -> Option<IpcRecord> {
        let header = self.peek(16)?;
        let total_len = NativeEndian::read_u64(&header[8..16]);
        let bytes = self.peek(total_len)?;
        let record = IpcRecord::decode(bytes);
        self.pop(total_len);
        record
    }
}

const TAG_KERNEL_DEF: u64 = 1;
const TAG_KERNEL: u64 = 2;
const TAG_OMP_ENTER: u64 = 3;
const TAG_OMP_LEAVE: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OmpContextKind {
    Parallel,
    Sync,
    Task,
    Loop,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmpContext {
    pub kind: OmpContextKind,
    pub addr: u64,
    pub thread: i32,
    pub num_threads: u32,
}

/// The record vocabulary of the agent rings. Timestamps are already in the
/// local clock domain; agents link against the same clock code.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcRecord {
    KernelDef {
        id: u64,
        name: String,
    },
    Kernel {
        start: Timestamp,
        end: Timestamp,
        id: u64,
    },
    OmpEnter {
        time: Timestamp,
        ctx: OmpContext,
    },
    OmpLeave {
        time: Timestamp,
        ctx: OmpContext,
    },
}

fn omp_kind_tag(kind: OmpContextKind) -> u64 {
    match kind {
        OmpContextKind::Parallel => 0,
        OmpContextKind::Sync => 1,
        OmpContextKind::Task => 2,
        OmpContextKind::Loop => 3,
        OmpContextKind::Other => 4,
    }
}

fn omp_kind_from_tag(tag: u64) -> OmpContextKind {
    match tag {
        0 => OmpContextKind::Parallel,
        1 => OmpContextKind::Sync,
        2 => OmpContextKind::Task,
        3 => OmpContextKind::Loop,
        _ => OmpContextKind::Other,
    }
}

impl IpcRecord {
    /// `[tag, total_len, payload...]`, padded to 8 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        let tag = match self {
            IpcRecord::KernelDef { id, name } => {
                let mut buf = [0u8; 8];
                NativeEndian::write_u64(&mut buf, *id);
                payload.extend_from_slice(&buf);
                NativeEndian::write_u64(&mut buf, name.len() as u64);
                payload.extend_from_slice(&buf);
                payload.extend_from_slice(name.as_bytes());
                TAG_KERNEL_DEF
            }
            IpcRecord::Kernel { start, end, id } => {
                for value in [start.nanos(), end.nanos(), *id] {
                    let mut buf = [0u8; 8];
                    NativeEndian::write_u64(&mut buf, value);
                    payload.extend_from_slice(&buf);
                }
                TAG_KERNEL
            }
            IpcRecord::OmpEnter { time, ctx } | IpcRecord::OmpLeave { time, ctx } => {
                for value in [
                    time.nanos(),
                    omp_kind_tag(ctx.kind),
                    ctx.addr,
                    ctx.thread as u64,
                    ctx.num_threads as u64,
                ] {
                    let mut buf = [0u8; 8];
                    NativeEndian::write_u64(&mut buf, value);
                    payload.extend_from_slice(&buf);
                }
                if matches!(self, IpcRecord::OmpEnter { .. }) {
                    TAG_OMP_ENTER
                } else {
                    TAG_OMP_LEAVE
                }
            }
        };

        let padded_payload = payload.len().div_ceil(8) * 8;
        let total_len = (16 + padded_payload) as u64;
        let mut out = Vec::with_capacity(total_len as usize);
        let mut buf = [0u8; 8];
        NativeEndian::write_u64(&mut buf, tag);
        out.extend_from_slice(&buf);
        NativeEndian::write_u64(&mut buf, total_len);
        out.extend_from_slice(&buf);
        out.extend_from_slice(&payload);
        out.resize(total_len as usize, 0);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<IpcRecord> {
        if bytes.len() < 16 {
            return None;
        }
        let tag = NativeEndian::read_u64(&bytes[0..8]);
        let payload = &bytes[16..];
        match tag {
            TAG_KERNEL_DEF => {
                if payload.len() < 16 {
                    return None;
                }
                let id = NativeEndian::read_u64(&payload[0..8]);
                let name_len = NativeEndian::read_u64(&payload[8..16]) as usize;
                let name = payload.get(16..16 + name_len)?;
                Some(IpcRecord::KernelDef {
                    id,
                    name: String::from_utf8_lossy(name).into_owned(),
                })
            }
            TAG_KERNEL => {
                if payload.len() < 24 {
                    return None;
                }
                Some(IpcRecord::Kernel {
                    start: Timestamp(NativeEndian::read_u64(&payload[0..8])),
                    end: Timestamp(NativeEndian::read_u64(&payload[8..16])),
                    id: NativeEndian::read_u64(&payload[16..24]),
                })
            }
            TAG_OMP_ENTER | TAG_OMP_LEAVE => {
                if payload.len() < 40 {
                    return None;
                }
                let time = Timestamp(NativeEndian::read_u64(&payload[0..8]));
                let ctx = OmpContext {
                    kind: omp_kind_from_tag(NativeEndian::read_u64(&payload[8..16])),
                    addr: NativeEndian::read_u64(&payload[16..24]),
                    thread: NativeEndian::read_u64(&payload[24..32]) as i32,
                    num_threads: NativeEndian::read_u64(&payload[32..40]) as u32,
                };
                if tag == TAG_OMP_ENTER {
                    Some(IpcRecord::OmpEnter { time, ctx })
                } else {
                    Some(IpcRecord::OmpLeave { time, ctx })
                }
            }
            other => {
                log::warn!("unknown ipc record tag {other}, skipping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memfd_ring(pages: usize) -> (RingWriter, RingReader) {
        use std::os::fd::AsFd;
        let name = std::ffi::CString::new("otter-ring-test").unwrap();
        let fd = nix::sys::memfd::memfd_create(&name, nix::sys::memfd::MemFdCreateFlag::empty())
            .expect("memfd_create");
        let writer_ring = ShmRing::create(fd, pages).expect("create ring");
        let reader_fd = writer_ring.fd().as_fd().try_clone_to_owned().unwrap();
        let reader_ring = ShmRing::open(reader_fd).expect("open ring");
        (RingWriter::new(writer_ring), RingReader::new(reader_ring))
    }

    #[test]
    fn produce_then_consume() {
        let (mut writer, mut reader) = memfd_ring(1);

        let record = IpcRecord::Kernel {
            start: Timestamp(100),
            end: Timestamp(200),
            id: 7,
        };
        assert!(writer.write_record(&record));
        assert_eq!(reader.read_record(), Some(record));
        assert_eq!(reader.read_record(), None);
    }

    #[test]
    fn reservation_fails_when_full() {
        let (mut writer, _reader) = memfd_ring(1);
        let size = writer.ring.size();
        // The ring keeps one byte free.
        assert!(writer.reserve(size).is_none());
        assert!(writer.reserve(size - 1).is_some());
        writer.commit();
        assert!(writer.reserve(8).is_none());
    }

    #[test]
    fn wrapping_record_is_contiguous() {
        let (mut writer, mut reader) = memfd_ring(1);
        let size = writer.ring.size();

        // Walk the cursors close to the end of the ring.
        let filler_len = size - 64;
        writer.reserve(filler_len).unwrap();
        writer.commit();
        reader.pop(filler_len);

        // This record spans the wrap; both sides see it contiguously.
        let record = IpcRecord::KernelDef {
            id: 42,
            name: "vector_add_kernel_with_a_rather_long_mangled_name_suffix".to_owned(),
        };
        let encoded_len = record.encode().len() as u64;
        assert!(encoded_len > 64, "record must actually wrap");
        assert!(writer.write_record(&record));
        assert_eq!(reader.read_record(), Some(record));
    }

    #[test]
    fn record_roundtrip_all_variants() {
        let records = [
            IpcRecord::KernelDef {
                id: 1,
                name: "k".into(),
            },
            IpcRecord::Kernel {
                start: Timestamp(1),
                end: Timestamp(2),
                id: 1,
            },
            IpcRecord::OmpEnter {
                time: Timestamp(3),
                ctx: OmpContext {
                    kind: OmpContextKind::Parallel,
                    addr: 0x4000,
                    thread: 12,
                    num_threads: 8,
                },
            },
            IpcRecord::OmpLeave {
                time: Timestamp(4),
                ctx: OmpContext {
                    kind: OmpContextKind::Sync,
                    addr: 0x4000,
                    thread: 12,
                    num_threads: 0,
                },
            },
        ];
        for record in records {
            let encoded = record.encode();
            assert_eq!(encoded.len() % 8, 0);
            assert_eq!(IpcRecord::decode(&encoded), Some(record));
        }
    }

    #[test]
    fn measurement_type_tags() {
        assert_eq!(MeasurementType::from_tag(1), Some(MeasurementType::Gpu));
        assert_eq!(MeasurementType::from_tag(2), Some(MeasurementType::OpenMp));
        assert_eq!(MeasurementType::from_tag(99), None);
        assert_eq!(MeasurementType::Gpu.tag(), 1);
    }
}
