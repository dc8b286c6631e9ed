//! Consumer side of the kernel's mapped perf ring buffer: a one-page header
//! with `head`/`tail` cursors followed by a power-of-two data region.

use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use byteorder::{ByteOrder, NativeEndian};

use super::sys::*;

/* perf caps record sizes at 16 bits */
const MAX_RECORD_SIZE: usize = 1 << 16;

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// The wake-up watermark for a ring of `pages` data pages: 80% of the data
/// region, so the kernel batches wakeups instead of poking us per record.
pub fn watermark_bytes(pages: usize) -> u32 {
    (pages * page_size() / 5 * 4) as u32
}

#[derive(Debug, Clone)]
pub struct MmapRecord {
    pub pid: i32,
    pub tid: i32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub filename: String,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskRecord {
    pub pid: i32,
    pub ppid: i32,
    pub tid: i32,
    pub ptid: i32,
    pub time: u64,
}

#[derive(Debug, Clone)]
pub struct CommRecord {
    pub pid: i32,
    pub tid: i32,
    pub name: String,
    pub is_exec: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SwitchRecord {
    pub is_switch_out: bool,
    pub is_preempt: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SwitchCpuWideRecord {
    pub other_pid: i32,
    pub other_tid: i32,
    pub is_switch_out: bool,
    pub is_preempt: bool,
}

/// Receives the records of one `drain()` pass. Sample records arrive raw;
/// their layout depends on the event's `sample_type`, so the owner decodes
/// them with its `SampleParser`.
pub trait RecordHandler {
    fn handle_sample(&mut self, _data: &[u8], _misc: u16) {}
    fn handle_mmap(&mut self, _record: &MmapRecord) {}
    fn handle_fork(&mut self, _record: &TaskRecord) {}
    fn handle_exit(&mut self, _record: &TaskRecord) {}
    fn handle_comm(&mut self, _record: &CommRecord) {}
    /// `body` still contains the `sample_id` trailer for timestamp access.
    fn handle_switch(&mut self, _record: &SwitchRecord, _body: &[u8]) {}
    fn handle_switch_cpu_wide(&mut self, _record: &SwitchCpuWideRecord, _body: &[u8]) {}
    fn handle_lost(&mut self, _id: u64, _count: u64) {}
    fn handle_unknown(&mut self, _kind: u32) {}
}

enum RingMemory {
    Mapped {
        base: *mut u8,
        len: usize,
    },
    #[cfg(test)]
    Synthetic {
        buf: Box<[u64]>,
    },
}

/// Reader over one mapped perf ring buffer.
///
/// `drain` consumes everything between `tail` and the `head` observed at
/// entry. Records crossing the ring wrap are reassembled in a scratch
/// buffer. Overflow does not attempt recovery of partial records; the
/// reader accounts the loss and resynchronizes at `head`.
pub struct RingBuffer {
    memory: RingMemory,
    data_size: u64,
    page_size: usize,
    scratch: Box<[u8]>,
    total_records: u64,
    consumed_bytes: u64,
    throttle_records: u64,
    lost_records: u64,
}

// The raw pointer aliases kernel-shared memory which is only touched through
// volatile/fenced accesses from the owning monitor thread.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Maps the header page plus `pages` data pages of an open event fd.
    /// `pages` must be a power of two.
    pub fn new(fd: RawFd, pages: usize) -> io::Result<RingBuffer> {
        if pages == 0 || !pages.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mmap_pages must be a power of two, got {pages}"),
            ));
        }

        let page_size = page_size();
        let len = (pages + 1) * page_size;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED || base.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(RingBuffer {
            memory: RingMemory::Mapped {
                base: base as *mut u8,
                len,
            },
            data_size: (pages * page_size) as u64,
            page_size,
            scratch: vec![0u8; MAX_RECORD_SIZE].into_boxed_slice(),
            total_records: 0,
            consumed_bytes: 0,
            throttle_records: 0,
            lost_records: 0,
        })
    }

    /// A ring over plain memory instead of a kernel mapping. This is how the
    /// reader logic gets exercised without a live perf fd.
    #[cfg(test)]
    pub fn synthetic(data_size: u64) -> RingBuffer {
        assert!(data_size.is_power_of_two());
        let page_size = 4096;
        let words = (page_size as u64 + data_size) as usize / 8;
        RingBuffer {
            memory: RingMemory::Synthetic {
                buf: vec![0u64; words].into_boxed_slice(),
            },
            data_size,
            page_size,
            scratch: vec![0u8; MAX_RECORD_SIZE].into_boxed_slice(),
            total_records: 0,
            consumed_bytes: 0,
            throttle_records: 0,
            lost_records: 0,
        }
    }

    fn base(&self) -> *mut u8 {
        match &self.memory {
            RingMemory::Mapped { base, .. } => *base,
            #[cfg(test)]
            RingMemory::Synthetic { buf } => buf.as_ptr() as *mut u8,
        }
    }

    fn header(&self) -> *mut PerfEventMmapPage {
        self.base() as *mut PerfEventMmapPage
    }

    fn data_ptr(&self) -> *const u8 {
        unsafe { self.base().add(self.page_size) }
    }

    fn read_head(&self) -> u64 {
        let head = unsafe { ptr::read_volatile(&(*self.header()).data_head) };
        fence(Ordering::Acquire);
        head
    }

    fn read_tail(&self) -> u64 {
        // Only written by us, no fence needed to read it back.
        unsafe { ptr::read_volatile(&(*self.header()).data_tail) }
    }

    fn write_tail(&mut self, tail: u64) {
        // All reads of the consumed region must complete before the kernel
        // may reuse it.
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(&mut (*self.header()).data_tail, tail) };
    }

    pub fn has_pending(&self) -> bool {
        self.read_head() != self.read_tail()
    }

    pub fn lost_records(&self) -> u64 {
        self.lost_records
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    /// Processes all records strictly between `tail` and the `head` observed
    /// at entry, then publishes the new `tail`.
    pub fn drain(&mut self, handler: &mut dyn RecordHandler) {
        let head = self.read_head();
        let mut tail = self.read_tail();

        if head.wrapping_sub(tail) > self.data_size {
            // The producer lapped us. There is no way to tell where record
            // boundaries are in the overwritten span, so skip it entirely.
            let skipped = head.wrapping_sub(tail);
            let mean = if self.total_records > 0 {
                (self.consumed_bytes / self.total_records).max(1)
            } else {
                64
            };
            let missed = skipped / mean;
            self.lost_records += missed;
            log::error!(
                "perf ring buffer overflow, about {missed} records lost; \
                 increase the buffer size or the sampling period"
            );
            self.write_tail(head);
            return;
        }

        while tail < head {
            let index = (tail % self.data_size) as usize;
            let header_bytes = self.bytes_at(index, std::mem::size_of::<PerfEventHeader>());
            let kind = NativeEndian::read_u32(&header_bytes[0..4]);
            let misc = NativeEndian::read_u16(&header_bytes[4..6]);
            let size = NativeEndian::read_u16(&header_bytes[6..8]) as usize;

            if size < std::mem::size_of::<PerfEventHeader>() {
                log::error!("malformed perf record of size {size}, resynchronizing");
                tail = head;
                break;
            }
            if tail + size as u64 > head {
                log::warn!("perf record goes beyond head, skipping");
                break;
            }

            self.total_records += 1;
            self.consumed_bytes += size as u64;

            let body_len = size - std::mem::size_of::<PerfEventHeader>();
            let body_index = (index + std::mem::size_of::<PerfEventHeader>()) % self.data_size as usize;
            let body = self.bytes_at(body_index, body_len);
            self.dispatch(kind, misc, &body, handler);

            tail += size as u64;
        }

        self.write_tail(tail);
    }

    /// Copies `len` bytes starting at `index`, stitching across the wrap.
    fn bytes_at(&mut self, index: usize, len: usize) -> Vec<u8> {
        let data = self.data_ptr();
        let size = self.data_size as usize;
        let mut out;
        unsafe {
            if index + len <= size {
                out = std::slice::from_raw_parts(data.add(index), len).to_vec();
            } else {
                let first = size - index;
                let scratch = &mut self.scratch[..len];
                scratch[..first]
                    .copy_from_slice(std::slice::from_raw_parts(data.add(index), first));
                scratch[first..]
                    .copy_from_slice(std::slice::from_raw_parts(data, len - first));
                out = scratch.to_vec();
            }
        }
        out.truncate(len);
        out
    }

    fn dispatch(&mut self, kind: u32, misc: u16, body: &[u8], handler: &mut dyn RecordHandler) {
        match kind {
            PERF_RECORD_MMAP => {
                if let Some(record) = parse_mmap(body, false) {
                    handler.handle_mmap(&record);
                }
            }
            PERF_RECORD_MMAP2 => {
                if let Some(record) = parse_mmap(body, true) {
                    handler.handle_mmap(&record);
                }
            }
            PERF_RECORD_FORK => {
                if let Some(record) = parse_task(body) {
                    handler.handle_fork(&record);
                }
            }
            PERF_RECORD_EXIT => {
                if let Some(record) = parse_task(body) {
                    handler.handle_exit(&record);
                }
            }
            PERF_RECORD_COMM => {
                if let Some(record) = parse_comm(body, misc) {
                    handler.handle_comm(&record);
                }
            }
            PERF_RECORD_LOST => {
                if body.len() >= 16 {
                    let id = NativeEndian::read_u64(&body[0..8]);
                    let lost = NativeEndian::read_u64(&body[8..16]);
                    self.lost_records += lost;
                    log::info!("lost {lost} records on event {id}");
                    handler.handle_lost(id, lost);
                }
            }
            PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => {
                self.throttle_records += 1;
            }
            PERF_RECORD_SAMPLE => handler.handle_sample(body, misc),
            PERF_RECORD_SWITCH => {
                handler.handle_switch(
                    &SwitchRecord {
                        is_switch_out: misc & PERF_RECORD_MISC_SWITCH_OUT != 0,
                        is_preempt: misc & PERF_RECORD_MISC_SWITCH_OUT_PREEMPT != 0,
                    },
                    body,
                );
            }
            PERF_RECORD_SWITCH_CPU_WIDE => {
                if body.len() >= 8 {
                    handler.handle_switch_cpu_wide(
                        &SwitchCpuWideRecord {
                            other_pid: NativeEndian::read_i32(&body[0..4]),
                            other_tid: NativeEndian::read_i32(&body[4..8]),
                            is_switch_out: misc & PERF_RECORD_MISC_SWITCH_OUT != 0,
                            is_preempt: misc & PERF_RECORD_MISC_SWITCH_OUT_PREEMPT != 0,
                        },
                        body,
                    );
                }
            }
            other => {
                log::warn!("unknown perf record type {other}, skipping");
                handler.handle_unknown(other);
            }
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if self.lost_records > 0 {
            log::warn!("lost a total of {} records in this ring", self.lost_records);
        }
        if let RingMemory::Mapped { base, len } = self.memory {
            unsafe {
                libc::munmap(base as *mut libc::c_void, len);
            }
        }
    }
}

fn parse_mmap(body: &[u8], is_mmap2: bool) -> Option<MmapRecord> {
    let fixed = if is_mmap2 { 64 } else { 32 };
    if body.len() < fixed {
        return None;
    }
    let filename_bytes = &body[fixed..];
    let nul = memchr::memchr(0, filename_bytes).unwrap_or(filename_bytes.len());
    Some(MmapRecord {
        pid: NativeEndian::read_i32(&body[0..4]),
        tid: NativeEndian::read_i32(&body[4..8]),
        addr: NativeEndian::read_u64(&body[8..16]),
        len: NativeEndian::read_u64(&body[16..24]),
        pgoff: NativeEndian::read_u64(&body[24..32]),
        filename: String::from_utf8_lossy(&filename_bytes[..nul]).into_owned(),
    })
}

fn parse_task(body: &[u8]) -> Option<TaskRecord> {
    if body.len() < 24 {
        return None;
    }
    Some(TaskRecord {
        pid: NativeEndian::read_i32(&body[0..4]),
        ppid: NativeEndian::read_i32(&body[4..8]),
        tid: NativeEndian::read_i32(&body[8..12]),
        ptid: NativeEndian::read_i32(&body[12..16]),
        time: NativeEndian::read_u64(&body[16..24]),
    })
}

fn parse_comm(body: &[u8], misc: u16) -> Option<CommRecord> {
    if body.len() < 8 {
        return None;
    }
    let name_bytes = &body[8..];
    let nul = memchr::memchr(0, name_bytes).unwrap_or(name_bytes.len());
    Some(CommRecord {
        pid: NativeEndian::read_i32(&body[0..4]),
        tid: NativeEndian::read_i32(&body[4..8]),
        name: String::from_utf8_lossy(&name_bytes[..nul]).into_owned(),
        is_exec: misc & PERF_RECORD_MISC_COMM_EXEC != 0,
    })
}

/// Decoded sample payload; which fields are present depends on the event's
/// `sample_type`.
#[derive(Debug, Clone, Default)]
pub struct SampleRecord {
    pub identifier: Option<u64>,
    pub ip: Option<u64>,
    pub pid: Option<i32>,
    pub tid: Option<i32>,
    pub time: Option<u64>,
    pub addr: Option<u64>,
    pub id: Option<u64>,
    pub stream_id: Option<u64>,
    pub cpu: Option<u32>,
    pub period: Option<u64>,
    pub callchain: Option<Vec<u64>>,
    pub raw: Option<Vec<u8>>,
}

/// Decodes raw sample bodies according to one event's `sample_type`. Field
/// order is fixed by the perf ABI.
#[derive(Debug, Clone, Copy)]
pub struct SampleParser {
    sample_type: u64,
}

impl SampleParser {
    pub fn new(sample_type: u64) -> SampleParser {
        SampleParser { sample_type }
    }

    pub fn parse(&self, body: &[u8]) -> Option<SampleRecord> {
        let mut sample = SampleRecord::default();
        let mut pos = 0usize;

        let mut read_u64 = |pos: &mut usize| -> Option<u64> {
            let value = body.get(*pos..*pos + 8).map(NativeEndian::read_u64)?;
            *pos += 8;
            Some(value)
        };

        if self.sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            sample.identifier = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_IP != 0 {
            sample.ip = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_TID != 0 {
            let both = read_u64(&mut pos)?;
            sample.pid = Some(both as u32 as i32);
            sample.tid = Some((both >> 32) as u32 as i32);
        }
        if self.sample_type & PERF_SAMPLE_TIME != 0 {
            sample.time = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_ADDR != 0 {
            sample.addr = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_ID != 0 {
            sample.id = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            sample.stream_id = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_CPU != 0 {
            let both = read_u64(&mut pos)?;
            sample.cpu = Some(both as u32);
        }
        if self.sample_type & PERF_SAMPLE_PERIOD != 0 {
            sample.period = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_CALLCHAIN != 0 {
            let nr = read_u64(&mut pos)? as usize;
            let mut ips = Vec::with_capacity(nr.min(1024));
            for _ in 0..nr {
                ips.push(read_u64(&mut pos)?);
            }
            sample.callchain = Some(ips);
        }
        if self.sample_type & PERF_SAMPLE_RAW != 0 {
            let size = body.get(pos..pos + 4).map(NativeEndian::read_u32)? as usize;
            pos += 4;
            sample.raw = Some(body.get(pos..pos + size)?.to_vec());
        }

        Some(sample)
    }

    /// Decodes the `sample_id` trailer that `sample_id_all` appends to
    /// non-sample records. The trailer carries the same fields as a sample,
    /// restricted to the id-capable subset, at the end of the record body.
    pub fn parse_id_trailer(&self, body: &[u8]) -> Option<SampleRecord> {
        const ID_FLAGS: [u64; 6] = [
            PERF_SAMPLE_TID,
            PERF_SAMPLE_TIME,
            PERF_SAMPLE_ID,
            PERF_SAMPLE_STREAM_ID,
            PERF_SAMPLE_CPU,
            PERF_SAMPLE_IDENTIFIER,
        ];
        let trailer_len: usize = ID_FLAGS
            .iter()
            .filter(|&&flag| self.sample_type & flag != 0)
            .count()
            * 8;
        if trailer_len == 0 {
            return None;
        }
        let trailer = body.get(body.len().checked_sub(trailer_len)?..)?;

        let mut sample = SampleRecord::default();
        let mut pos = 0usize;
        let mut read_u64 = |pos: &mut usize| -> Option<u64> {
            let value = trailer.get(*pos..*pos + 8).map(NativeEndian::read_u64)?;
            *pos += 8;
            Some(value)
        };

        if self.sample_type & PERF_SAMPLE_TID != 0 {
            let both = read_u64(&mut pos)?;
            sample.pid = Some(both as u32 as i32);
            sample.tid = Some((both >> 32) as u32 as i32);
        }
        if self.sample_type & PERF_SAMPLE_TIME != 0 {
            sample.time = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_ID != 0 {
            sample.id = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_STREAM_ID != 0 {
            sample.stream_id = Some(read_u64(&mut pos)?);
        }
        if self.sample_type & PERF_SAMPLE_CPU != 0 {
            sample.cpu = Some(read_u64(&mut pos)? as u32);
        }
        if self.sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
            sample.identifier = Some(read_u64(&mut pos)?);
        }
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collector {
        samples: Vec<Vec<u8>>,
        mmaps: Vec<MmapRecord>,
        comms: Vec<CommRecord>,
        forks: Vec<TaskRecord>,
        unknown: Vec<u32>,
    }

    impl RecordHandler for Collector {
        fn handle_sample(&mut self, data: &[u8], _misc: u16) {
            self.samples.push(data.to_vec());
        }
        fn handle_mmap(&mut self, record: &MmapRecord) {
            self.mmaps.push(record.clone());
        }
        fn handle_comm(&mut self, record: &CommRecord) {
            self.comms.push(record.clone());
        }
        fn handle_fork(&mut self, record: &TaskRecord) {
            self.forks.push(*record);
        }
        fn handle_unknown(&mut self, kind: u32) {
            self.unknown.push(kind);
        }
    }

    fn make_record(kind: u32, misc: u16, body: &[u8]) -> Vec<u8> {
        let size = (8 + body.len()) as u16;
        let mut record = Vec::with_capacity(size as usize);
        record.extend_from_slice(&kind.to_ne_bytes());
        record.extend_from_slice(&misc.to_ne_bytes());
        record.extend_from_slice(&size.to_ne_bytes());
        record.extend_from_slice(body);
        record
    }

    /// Writes `record` at the current head, wrapping as the kernel would.
    fn publish(ring: &mut RingBuffer, record: &[u8]) {
        let head = unsafe { ptr::read_volatile(&(*ring.header()).data_head) };
        let size = ring.data_size as usize;
        let data = ring.data_ptr() as *mut u8;
        for (i, byte) in record.iter().enumerate() {
            let index = (head as usize + i) % size;
            unsafe { *data.add(index) = *byte };
        }
        unsafe {
            ptr::write_volatile(&mut (*ring.header()).data_head, head + record.len() as u64)
        };
    }

    #[test]
    fn drains_records_in_order_and_advances_tail() {
        let mut ring = RingBuffer::synthetic(4096);
        let r1 = make_record(PERF_RECORD_SAMPLE, 0, &[1u8; 24]);
        let r2 = make_record(PERF_RECORD_SAMPLE, 0, &[2u8; 16]);
        publish(&mut ring, &r1);
        publish(&mut ring, &r2);

        let mut collector = Collector::default();
        ring.drain(&mut collector);

        assert_eq!(collector.samples.len(), 2);
        assert_eq!(collector.samples[0], vec![1u8; 24]);
        assert_eq!(collector.samples[1], vec![2u8; 16]);
        assert_eq!(ring.read_tail(), (r1.len() + r2.len()) as u64);
        assert!(!ring.has_pending());
    }

    #[test]
    fn record_crossing_the_wrap_is_reassembled() {
        let mut ring = RingBuffer::synthetic(256);
        // Move the cursors close to the end of the ring so the next record
        // wraps.
        let filler = make_record(PERF_RECORD_SAMPLE, 0, &[0u8; 232]);
        publish(&mut ring, &filler);
        let mut collector = Collector::default();
        ring.drain(&mut collector);
        assert_eq!(ring.read_tail(), 240);

        let body: Vec<u8> = (0u8..64).collect();
        let wrapped = make_record(PERF_RECORD_SAMPLE, 0, &body);
        publish(&mut ring, &wrapped);

        let mut collector = Collector::default();
        ring.drain(&mut collector);
        assert_eq!(collector.samples.len(), 1);
        assert_eq!(collector.samples[0], body);
    }

    #[test]
    fn typed_records_are_dispatched() {
        let mut ring = RingBuffer::synthetic(4096);

        let mut mmap_body = Vec::new();
        mmap_body.extend_from_slice(&42i32.to_ne_bytes());
        mmap_body.extend_from_slice(&42i32.to_ne_bytes());
        mmap_body.extend_from_slice(&0x1000u64.to_ne_bytes());
        mmap_body.extend_from_slice(&0x2000u64.to_ne_bytes());
        mmap_body.extend_from_slice(&0u64.to_ne_bytes());
        mmap_body.extend_from_slice(b"/usr/lib/libc.so.6\0");
        publish(&mut ring, &make_record(PERF_RECORD_MMAP, 0, &mmap_body));

        let mut comm_body = Vec::new();
        comm_body.extend_from_slice(&42i32.to_ne_bytes());
        comm_body.extend_from_slice(&43i32.to_ne_bytes());
        comm_body.extend_from_slice(b"worker\0\0");
        publish(
            &mut ring,
            &make_record(PERF_RECORD_COMM, PERF_RECORD_MISC_COMM_EXEC, &comm_body),
        );

        let mut fork_body = Vec::new();
        fork_body.extend_from_slice(&44i32.to_ne_bytes());
        fork_body.extend_from_slice(&42i32.to_ne_bytes());
        fork_body.extend_from_slice(&44i32.to_ne_bytes());
        fork_body.extend_from_slice(&42i32.to_ne_bytes());
        fork_body.extend_from_slice(&123456u64.to_ne_bytes());
        publish(&mut ring, &make_record(PERF_RECORD_FORK, 0, &fork_body));

        publish(&mut ring, &make_record(900, 0, &[0u8; 8]));

        let mut collector = Collector::default();
        ring.drain(&mut collector);

        assert_eq!(collector.mmaps.len(), 1);
        let mmap = &collector.mmaps[0];
        assert_eq!(mmap.addr, 0x1000);
        assert_eq!(mmap.len, 0x2000);
        assert_eq!(mmap.filename, "/usr/lib/libc.so.6");

        assert_eq!(collector.comms.len(), 1);
        assert_eq!(collector.comms[0].name, "worker");
        assert!(collector.comms[0].is_exec);

        assert_eq!(collector.forks.len(), 1);
        assert_eq!(collector.forks[0].time, 123456);

        assert_eq!(collector.unknown, vec![900]);
    }

    #[test]
    fn overflow_is_accounted_and_resynced() {
        let mut ring = RingBuffer::synthetic(256);

        // Establish a mean record size first.
        publish(&mut ring, &make_record(PERF_RECORD_SAMPLE, 0, &[0u8; 24]));
        let mut collector = Collector::default();
        ring.drain(&mut collector);
        let consumed = ring.read_tail();

        // Simulate the producer lapping us.
        let head = consumed + 256 + 1024;
        unsafe { ptr::write_volatile(&mut (*ring.header()).data_head, head) };

        let mut collector = Collector::default();
        ring.drain(&mut collector);

        assert!(collector.samples.is_empty());
        assert_eq!(ring.read_tail(), head);
        assert_eq!(ring.lost_records(), (256 + 1024) / 32);

        // The reader keeps working after the overflow.
        publish(&mut ring, &make_record(PERF_RECORD_SAMPLE, 0, &[7u8; 24]));
        let mut collector = Collector::default();
        ring.drain(&mut collector);
        assert_eq!(collector.samples.len(), 1);
        assert_eq!(collector.samples[0], vec![7u8; 24]);
    }

    #[test]
    fn lost_record_accumulates() {
        let mut ring = RingBuffer::synthetic(4096);
        let mut body = Vec::new();
        body.extend_from_slice(&1u64.to_ne_bytes());
        body.extend_from_slice(&17u64.to_ne_bytes());
        publish(&mut ring, &make_record(PERF_RECORD_LOST, 0, &body));

        let mut collector = Collector::default();
        ring.drain(&mut collector);
        assert_eq!(ring.lost_records(), 17);
    }

    #[test]
    fn sample_parser_decodes_fields_in_abi_order() {
        let parser = SampleParser::new(
            PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CALLCHAIN,
        );
        let mut body = Vec::new();
        body.extend_from_slice(&0xdeadbeefu64.to_ne_bytes());
        let tid_pid = (77u64 << 32) | 42u64;
        body.extend_from_slice(&tid_pid.to_ne_bytes());
        body.extend_from_slice(&1000u64.to_ne_bytes());
        body.extend_from_slice(&3u64.to_ne_bytes());
        for ip in [0xffff_0000u64, 0x4000, 0x4100] {
            body.extend_from_slice(&ip.to_ne_bytes());
        }

        let sample = parser.parse(&body).unwrap();
        assert_eq!(sample.ip, Some(0xdeadbeef));
        assert_eq!(sample.pid, Some(42));
        assert_eq!(sample.tid, Some(77));
        assert_eq!(sample.time, Some(1000));
        assert_eq!(
            sample.callchain,
            Some(vec![0xffff_0000, 0x4000, 0x4100])
        );
    }

    #[test]
    fn sample_parser_rejects_truncated_bodies() {
        let parser = SampleParser::new(PERF_SAMPLE_IP | PERF_SAMPLE_TIME);
        assert!(parser.parse(&[0u8; 8]).is_none());
    }

    #[test]
    fn id_trailer_parse() {
        let parser = SampleParser::new(PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU);
        // A switch-cpu-wide body: next pid/tid, then the trailer.
        let mut body = Vec::new();
        body.extend_from_slice(&55i32.to_ne_bytes());
        body.extend_from_slice(&56i32.to_ne_bytes());
        let tid_pid = (12u64 << 32) | 11u64;
        body.extend_from_slice(&tid_pid.to_ne_bytes());
        body.extend_from_slice(&777u64.to_ne_bytes());
        body.extend_from_slice(&2u64.to_ne_bytes());

        let trailer = parser.parse_id_trailer(&body).unwrap();
        assert_eq!(trailer.pid, Some(11));
        assert_eq!(trailer.tid, Some(12));
        assert_eq!(trailer.time, Some(777));
        assert_eq!(trailer.cpu, Some(2));
    }

    #[test]
    fn raw_payload_parse() {
        let parser = SampleParser::new(PERF_SAMPLE_TIME | PERF_SAMPLE_RAW);
        let mut body = Vec::new();
        body.extend_from_slice(&5u64.to_ne_bytes());
        body.extend_from_slice(&4u32.to_ne_bytes());
        body.extend_from_slice(&[9, 8, 7, 6]);
        let sample = parser.parse(&body).unwrap();
        assert_eq!(sample.time, Some(5));
        assert_eq!(sample.raw, Some(vec![9, 8, 7, 6]));
    }
}
