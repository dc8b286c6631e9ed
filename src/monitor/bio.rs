//! Block-layer I/O recording through the `block:block_rq_*` and
//! `nvme:nvme_*` tracepoints, one event per CPU, attributed to the disk the
//! request targets.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{MonitorHandle, PollSet};
use crate::clock::ClockConverter;
use crate::config::Config;
use crate::otf2::{Event, EventWriter, IoHandleRef, IoOperationMode, LocationType};
use crate::perf::ring_buffer::RecordHandler;
use crate::perf::tracepoint::{TracepointField, TracepointFormat};
use crate::perf::{EventAttr, EventGuard, OpenTarget, RingBuffer, SampleParser};
use crate::topology::Topology;
use crate::trace::Trace;
use crate::types::{BlockDevice, BlockDeviceKind, MeasurementScope};

/// Parses one `/sys/dev/block/<maj:min>/uevent` file.
fn parse_uevent(content: &str) -> (Option<String>, Option<String>, Option<u32>, Option<u32>) {
    let mut devname = None;
    let mut devtype = None;
    let mut major = None;
    let mut minor = None;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("DEVNAME=") {
            devname = Some(format!("/dev/{value}"));
        } else if let Some(value) = line.strip_prefix("DEVTYPE=") {
            devtype = Some(value.to_owned());
        } else if let Some(value) = line.strip_prefix("MAJOR=") {
            major = value.parse().ok();
        } else if let Some(value) = line.strip_prefix("MINOR=") {
            minor = value.parse().ok();
        }
    }
    (devname, devtype, major, minor)
}

fn makedev(major: u32, minor: u32) -> u64 {
    unsafe { libc::makedev(major, minor) }
}

/// All block devices from `/sys/dev/block`, partitions associated with
/// their parent disk.
pub fn enumerate_block_devices() -> FxHashMap<u64, BlockDevice> {
    let mut result = FxHashMap::default();
    let Ok(entries) = fs::read_dir("/sys/dev/block") else {
        return result;
    };

    for entry in entries.flatten() {
        let uevent = match fs::read_to_string(entry.path().join("uevent")) {
            Ok(content) => content,
            Err(_) => continue,
        };
        let (devname, devtype, major, minor) = parse_uevent(&uevent);
        let (Some(major), Some(minor)) = (major, minor) else {
            continue;
        };
        let name = devname.unwrap_or_else(|| "unknown device".to_owned());
        let dev = makedev(major, minor);

        if devtype.as_deref() == Some("partition") {
            // The sysfs entry is a symlink into the disk's directory; the
            // parent directory holds the disk's uevent.
            let parent = fs::read_link(entry.path())
                .ok()
                .and_then(|target| {
                    let parent_dir = Path::new("/sys/dev/block")
                        .join(target)
                        .parent()
                        .map(|p| p.to_path_buf())?;
                    fs::read_to_string(parent_dir.join("uevent")).ok()
                })
                .and_then(|content| {
                    let (_, _, major, minor) = parse_uevent(&content);
                    Some(makedev(major?, minor?))
                });
            result.insert(
                dev,
                BlockDevice::partition(dev, name, parent.unwrap_or(dev)),
            );
        } else {
            result.insert(dev, BlockDevice::disk(dev, name));
        }
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BioEventKind {
    Insert,
    Issue,
    Complete,
}

struct BioEventSource {
    kind: BioEventKind,
    guard: EventGuard,
    ring: RingBuffer,
    parser: SampleParser,
    dev_field: TracepointField,
    sector_field: TracepointField,
    nr_sector_field: TracepointField,
    rwbs_field: TracepointField,
}

struct DeviceWriter {
    writer: EventWriter,
    handle: IoHandleRef,
}

/// One thread draining all block tracepoint rings and writing
/// `io_operation_*` events onto per-disk handles. `(device, sector)` forms
/// the matching id between begin and complete.
pub struct BioMonitor {
    trace: Arc<Trace>,
    converter: ClockConverter,
    sources: Vec<BioEventSource>,
    writers: FxHashMap<u64, DeviceWriter>,
}

impl BioMonitor {
    pub fn create(
        trace: Arc<Trace>,
        converter: ClockConverter,
        config: &Config,
    ) -> std::io::Result<BioMonitor> {
        let mut sources = Vec::new();

        for (event, kind) in [
            ("block:block_rq_insert", BioEventKind::Insert),
            ("block:block_rq_issue", BioEventKind::Issue),
            ("block:block_rq_complete", BioEventKind::Complete),
        ] {
            let format = match TracepointFormat::by_name(event) {
                Ok(format) => format,
                Err(err) => {
                    log::error!("cannot record block i/o: {err}");
                    return Err(std::io::Error::other(err.to_string()));
                }
            };
            let dev_field = format.field("dev").map_err(io_err)?.clone();
            let sector_field = format.field("sector").map_err(io_err)?.clone();
            let nr_sector_field = format.field("nr_sector").map_err(io_err)?.clone();
            let rwbs_field = format.field("rwbs").map_err(io_err)?.clone();

            for cpu in Topology::instance().cpus() {
                let mut attr = EventAttr::tracepoint(event).map_err(io_err)?;
                attr.set_clockid(config.clockid);
                attr.set_disabled();
                let guard = attr
                    .open(OpenTarget::Cpu(cpu), None, None)
                    .map_err(io_err)?;
                guard.set_nonblocking().map_err(|e| io_err_errno(e))?;
                let ring = RingBuffer::new(guard.fd(), config.mmap_pages)?;
                sources.push(BioEventSource {
                    kind,
                    parser: SampleParser::new(attr.sample_type()),
                    guard,
                    ring,
                    dev_field: dev_field.clone(),
                    sector_field: sector_field.clone(),
                    nr_sector_field: nr_sector_field.clone(),
                    rwbs_field: rwbs_field.clone(),
                });
            }
        }

        Ok(BioMonitor {
            trace,
            converter,
            sources,
            writers: FxHashMap::default(),
        })
    }

    pub fn spawn(self) -> MonitorHandle {
        super::spawn("block i/o", move |stop| self.run(stop))
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        for source in &self.sources {
            if let Err(err) = source.guard.enable() {
                log::warn!("failed to enable a block tracepoint: {err}");
            }
        }

        let mut poll = PollSet::new();
        for source in &self.sources {
            poll.add_fd(source.guard.fd());
        }

        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            poll.poll();
            self.drain();
        }

        for source in &self.sources {
            let _ = source.guard.disable();
        }
        self.drain();

        for (_, device) in self.writers.drain() {
            let mut writer = device.writer;
            writer.finish();
        }
    }

    fn drain(&mut self) {
        for source in &mut self.sources {
            let mut handler = BioHandler {
                kind: source.kind,
                parser: &source.parser,
                converter: &self.converter,
                trace: &self.trace,
                writers: &mut self.writers,
                dev_field: &source.dev_field,
                sector_field: &source.sector_field,
                nr_sector_field: &source.nr_sector_field,
                rwbs_field: &source.rwbs_field,
            };
            source.ring.drain(&mut handler);
        }
    }
}

fn io_err(err: crate::perf::EventError) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

fn io_err_errno(err: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from(err)
}

struct BioHandler<'a> {
    kind: BioEventKind,
    parser: &'a SampleParser,
    converter: &'a ClockConverter,
    trace: &'a Trace,
    writers: &'a mut FxHashMap<u64, DeviceWriter>,
    dev_field: &'a TracepointField,
    sector_field: &'a TracepointField,
    nr_sector_field: &'a TracepointField,
    rwbs_field: &'a TracepointField,
}

impl BioHandler<'_> {
    /// The writer of the disk behind `dev`; partitions resolve to their
    /// parent.
    fn device_writer(&mut self, dev: u64) -> Option<&mut DeviceWriter> {
        let disk = match self.trace.block_device(dev) {
            Some(device) if device.kind == BlockDeviceKind::Partition => {
                device.parent.unwrap_or(dev)
            }
            _ => dev,
        };

        if !self.writers.contains_key(&disk) {
            let handle = self.trace.block_io_handle(disk)?;
            let writer = self
                .trace
                .create_writer(MeasurementScope::bio(disk), LocationType::IoDevice)
                .ok()?;
            self.writers.insert(disk, DeviceWriter { writer, handle });
        }
        self.writers.get_mut(&disk)
    }
}

impl RecordHandler for BioHandler<'_> {
    fn handle_sample(&mut self, data: &[u8], _misc: u16) {
        let Some(sample) = self.parser.parse(data) else {
            return;
        };
        let (Some(time), Some(raw)) = (sample.time, &sample.raw) else {
            return;
        };

        let Some(dev) = self.dev_field.read(raw) else {
            return;
        };
        let Some(sector) = self.sector_field.read(raw) else {
            return;
        };
        let nr_sector = self.nr_sector_field.read(raw).unwrap_or(0);
        let is_write = self
            .rwbs_field
            .bytes(raw)
            .is_some_and(|rwbs| rwbs.contains(&b'W'));

        let kind = self.kind;
        let time = self.converter.convert(time);
        let Some(device) = self.device_writer(dev) else {
            return;
        };
        let time = device.writer.adjust_time(time);
        let handle = device.handle;

        match kind {
            BioEventKind::Insert => {
                device.writer.write(Event::IoOperationBegin {
                    time,
                    handle,
                    mode: if is_write {
                        IoOperationMode::Write
                    } else {
                        IoOperationMode::Read
                    },
                    bytes: nr_sector,
                    matching_id: sector,
                });
            }
            BioEventKind::Issue => {
                device.writer.write(Event::IoOperationIssued {
                    time,
                    handle,
                    matching_id: sector,
                });
            }
            BioEventKind::Complete => {
                device.writer.write(Event::IoOperationComplete {
                    time,
                    handle,
                    bytes: nr_sector,
                    matching_id: sector,
                });
            }
        }
    }
}

/// NVMe command-level tracepoints, matched by `(device, cid)`. Opened only
/// when the nvme tracepoint group exists.
pub struct NvmeMonitor {
    trace: Arc<Trace>,
    converter: ClockConverter,
    sources: Vec<NvmeEventSource>,
    writers: FxHashMap<u64, DeviceWriter>,
    devices_by_name: FxHashMap<String, u64>,
}

struct NvmeEventSource {
    is_setup: bool,
    guard: EventGuard,
    ring: RingBuffer,
    parser: SampleParser,
    cid_field: TracepointField,
    disk_field: TracepointField,
}

impl NvmeMonitor {
    pub fn create(
        trace: Arc<Trace>,
        converter: ClockConverter,
        config: &Config,
    ) -> Option<NvmeMonitor> {
        let mut sources = Vec::new();
        for (event, is_setup) in [
            ("nvme:nvme_setup_cmd", true),
            ("nvme:nvme_complete_rq", false),
        ] {
            let format = match TracepointFormat::by_name(event) {
                Ok(format) => format,
                Err(err) => {
                    log::debug!("nvme tracing unavailable: {err}");
                    return None;
                }
            };
            let cid_field = format.field("cid").ok()?.clone();
            let disk_field = format.field("disk").ok()?.clone();

            for cpu in Topology::instance().cpus() {
                let mut attr = EventAttr::tracepoint(event).ok()?;
                attr.set_clockid(config.clockid);
                attr.set_disabled();
                let guard = attr.open(OpenTarget::Cpu(cpu), None, None).ok()?;
                guard.set_nonblocking().ok()?;
                let ring = RingBuffer::new(guard.fd(), config.mmap_pages).ok()?;
                sources.push(NvmeEventSource {
                    is_setup,
                    parser: SampleParser::new(attr.sample_type()),
                    guard,
                    ring,
                    cid_field: cid_field.clone(),
                    disk_field: disk_field.clone(),
                });
            }
        }

        let devices_by_name = enumerate_block_devices()
            .into_values()
            .map(|device| {
                let short = device
                    .name
                    .strip_prefix("/dev/")
                    .unwrap_or(&device.name)
                    .to_owned();
                (short, device.dev)
            })
            .collect();

        Some(NvmeMonitor {
            trace,
            converter,
            sources,
            writers: FxHashMap::default(),
            devices_by_name,
        })
    }

    pub fn spawn(self) -> MonitorHandle {
        super::spawn("nvme i/o", move |stop| self.run(stop))
    }

    fn run(mut self, stop: Arc<AtomicBool>) {
        for source in &self.sources {
            let _ = source.guard.enable();
        }
        let mut poll = PollSet::new();
        for source in &self.sources {
            poll.add_fd(source.guard.fd());
        }

        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            poll.poll();
            self.drain();
        }

        for source in &self.sources {
            let _ = source.guard.disable();
        }
        self.drain();
        for (_, device) in self.writers.drain() {
            let mut writer = device.writer;
            writer.finish();
        }
    }

    fn drain(&mut self) {
        for i in 0..self.sources.len() {
            loop {
                let source = &mut self.sources[i];
                let mut samples = Vec::new();
                let mut collector = RawCollector {
                    parser: &source.parser,
                    samples: &mut samples,
                };
                source.ring.drain(&mut collector);
                if samples.is_empty() {
                    break;
                }
                for (time, raw) in samples {
                    self.handle_nvme_sample(i, time, &raw);
                }
            }
        }
    }

    fn handle_nvme_sample(&mut self, source_index: usize, time: u64, raw: &[u8]) {
        let source = &self.sources[source_index];
        let Some(cid) = source.cid_field.read(raw) else {
            return;
        };
        let disk_name = source
            .disk_field
            .bytes(raw)
            .map(|bytes| {
                let nul = memchr::memchr(0, bytes).unwrap_or(bytes.len());
                String::from_utf8_lossy(&bytes[..nul]).into_owned()
            })
            .unwrap_or_default();
        let Some(&dev) = self.devices_by_name.get(&disk_name) else {
            return;
        };
        let is_setup = source.is_setup;

        let time = self.converter.convert(time);
        let trace = &self.trace;
        let writers = &mut self.writers;
        if !writers.contains_key(&dev) {
            let Some(handle) = trace.block_io_handle(dev) else {
                return;
            };
            let Ok(writer) =
                trace.create_writer(MeasurementScope::bio(dev), LocationType::IoDevice)
            else {
                return;
            };
            writers.insert(dev, DeviceWriter { writer, handle });
        }
        let device = writers.get_mut(&dev).unwrap();
        let time = device.writer.adjust_time(time);

        if is_setup {
            device.writer.write(Event::IoOperationBegin {
                time,
                handle: device.handle,
                mode: IoOperationMode::Write,
                bytes: 0,
                matching_id: cid,
            });
        } else {
            device.writer.write(Event::IoOperationComplete {
                time,
                handle: device.handle,
                bytes: 0,
                matching_id: cid,
            });
        }
    }
}

struct RawCollector<'a> {
    parser: &'a SampleParser,
    samples: &'a mut Vec<(u64, Vec<u8>)>,
}

impl RecordHandler for RawCollector<'_> {
    fn handle_sample(&mut self, data: &[u8], _misc: u16) {
        if let Some(sample) = self.parser.parse(data) {
            if let (Some(time), Some(raw)) = (sample.time, sample.raw) {
                self.samples.push((time, raw));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uevent_parse() {
        let content = "\
MAJOR=8
MINOR=1
DEVNAME=sda1
DEVTYPE=partition
DISKSEQ=2
PARTN=1
";
        let (devname, devtype, major, minor) = parse_uevent(content);
        assert_eq!(devname.as_deref(), Some("/dev/sda1"));
        assert_eq!(devtype.as_deref(), Some("partition"));
        assert_eq!(major, Some(8));
        assert_eq!(minor, Some(1));
    }

    #[test]
    fn uevent_parse_disk() {
        let content = "MAJOR=8\nMINOR=0\nDEVNAME=sda\nDEVTYPE=disk\n";
        let (devname, devtype, major, minor) = parse_uevent(content);
        assert_eq!(devname.as_deref(), Some("/dev/sda"));
        assert_eq!(devtype.as_deref(), Some("disk"));
        assert_eq!(makedev(major.unwrap(), minor.unwrap()), makedev(8, 0));
    }

    #[test]
    fn uevent_parse_incomplete() {
        let (devname, devtype, major, minor) = parse_uevent("DRIVER=nvme\n");
        assert_eq!(devname, None);
        assert_eq!(devtype, None);
        assert_eq!(major, None);
        assert_eq!(minor, None);
    }
}
