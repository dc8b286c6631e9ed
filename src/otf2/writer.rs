use std::io::{self, BufWriter, Write};

use byteorder::{NativeEndian, WriteBytesExt};

use super::{
    CallingContextRef, CommRef, InterruptGeneratorRef, IoHandleRef, IoOperationMode, LocationRef,
    MetricInstanceRef, Timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Uint(u64),
    Double(f64),
}

/// One record of a per-location event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CallingContextEnter {
        time: Timestamp,
        calling_context: CallingContextRef,
        unwind_distance: u32,
    },
    CallingContextLeave {
        time: Timestamp,
        calling_context: CallingContextRef,
    },
    CallingContextSample {
        time: Timestamp,
        calling_context: CallingContextRef,
        unwind_distance: u32,
        interrupt_generator: InterruptGeneratorRef,
    },
    ThreadBegin {
        time: Timestamp,
        comm: CommRef,
    },
    ThreadEnd {
        time: Timestamp,
        comm: CommRef,
    },
    Metric {
        time: Timestamp,
        instance: MetricInstanceRef,
        values: Vec<MetricValue>,
    },
    IoCreateHandle {
        time: Timestamp,
        handle: IoHandleRef,
    },
    IoDestroyHandle {
        time: Timestamp,
        handle: IoHandleRef,
    },
    IoOperationBegin {
        time: Timestamp,
        handle: IoHandleRef,
        mode: IoOperationMode,
        bytes: u64,
        matching_id: u64,
    },
    IoOperationIssued {
        time: Timestamp,
        handle: IoHandleRef,
        matching_id: u64,
    },
    IoOperationComplete {
        time: Timestamp,
        handle: IoHandleRef,
        bytes: u64,
        matching_id: u64,
    },
}

impl Event {
    pub fn time(&self) -> Timestamp {
        match self {
            Event::CallingContextEnter { time, .. }
            | Event::CallingContextLeave { time, .. }
            | Event::CallingContextSample { time, .. }
            | Event::ThreadBegin { time, .. }
            | Event::ThreadEnd { time, .. }
            | Event::Metric { time, .. }
            | Event::IoCreateHandle { time, .. }
            | Event::IoDestroyHandle { time, .. }
            | Event::IoOperationBegin { time, .. }
            | Event::IoOperationIssued { time, .. }
            | Event::IoOperationComplete { time, .. } => *time,
        }
    }

    fn with_time(mut self, t: Timestamp) -> Event {
        match &mut self {
            Event::CallingContextEnter { time, .. }
            | Event::CallingContextLeave { time, .. }
            | Event::CallingContextSample { time, .. }
            | Event::ThreadBegin { time, .. }
            | Event::ThreadEnd { time, .. }
            | Event::Metric { time, .. }
            | Event::IoCreateHandle { time, .. }
            | Event::IoDestroyHandle { time, .. }
            | Event::IoOperationBegin { time, .. }
            | Event::IoOperationIssued { time, .. }
            | Event::IoOperationComplete { time, .. } => *time = t,
        }
        self
    }
}

pub trait EventSink: Send {
    fn event(&mut self, event: &Event) -> io::Result<()>;
    fn mapping_table(&mut self, table: &[u32]) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()>;
}

/// Writes events of one location. Timestamps are forced to be non-decreasing:
/// kernel timestamps occasionally arrive out of order, and a reordered event
/// stream is worse for consumers than a clamped one.
pub struct EventWriter {
    location: LocationRef,
    sink: Box<dyn EventSink>,
    last_time: Timestamp,
    num_events: u64,
}

impl EventWriter {
    pub fn new(location: LocationRef, sink: Box<dyn EventSink>) -> EventWriter {
        EventWriter {
            location,
            sink,
            last_time: Timestamp::ZERO,
            num_events: 0,
        }
    }

    pub fn location(&self) -> LocationRef {
        self.location
    }

    pub fn num_events(&self) -> u64 {
        self.num_events
    }

    /// Clamps `time` forward to the last emitted timestamp.
    pub fn adjust_time(&mut self, time: Timestamp) -> Timestamp {
        if time < self.last_time {
            log::debug!(
                "out-of-order timestamp on location {}: {} < {}",
                self.location.0,
                time,
                self.last_time
            );
            return self.last_time;
        }
        self.last_time = time;
        time
    }

    pub fn write(&mut self, event: Event) {
        let time = self.adjust_time(event.time());
        let event = event.with_time(time);
        self.num_events += 1;
        if let Err(err) = self.sink.event(&event) {
            log::error!("failed to write event on location {}: {err}", self.location.0);
        }
    }

    pub fn write_mapping_table(&mut self, table: &[u32]) {
        if let Err(err) = self.sink.mapping_table(table) {
            log::error!(
                "failed to write mapping table on location {}: {err}",
                self.location.0
            );
        }
    }

    pub fn finish(&mut self) {
        if let Err(err) = self.sink.finish() {
            log::error!("failed to flush location {}: {err}", self.location.0);
        }
    }
}

const TAG_ENTER: u8 = 1;
const TAG_LEAVE: u8 = 2;
const TAG_SAMPLE: u8 = 3;
const TAG_THREAD_BEGIN: u8 = 4;
const TAG_THREAD_END: u8 = 5;
const TAG_METRIC: u8 = 6;
const TAG_IO_CREATE_HANDLE: u8 = 7;
const TAG_IO_DESTROY_HANDLE: u8 = 8;
const TAG_IO_OPERATION_BEGIN: u8 = 9;
const TAG_IO_OPERATION_COMPLETE: u8 = 10;
const TAG_MAPPING_TABLE: u8 = 11;
const TAG_IO_OPERATION_ISSUED: u8 = 12;

/// The on-disk encoding of one event stream: native-endian tagged records.
pub struct FileSink<W: Write + Send> {
    out: BufWriter<W>,
}

impl<W: Write + Send> FileSink<W> {
    pub fn new(inner: W) -> FileSink<W> {
        FileSink {
            out: BufWriter::new(inner),
        }
    }
}

fn io_mode_byte(mode: IoOperationMode) -> u8 {
    match mode {
        IoOperationMode::Read => 0,
        IoOperationMode::Write => 1,
        IoOperationMode::Flush => 2,
    }
}

impl<W: Write + Send> EventSink for FileSink<W> {
    fn event(&mut self, event: &Event) -> io::Result<()> {
        let out = &mut self.out;
        match event {
            Event::CallingContextEnter {
                time,
                calling_context,
                unwind_distance,
            } => {
                out.write_u8(TAG_ENTER)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(calling_context.0)?;
                out.write_u32::<NativeEndian>(*unwind_distance)?;
            }
            Event::CallingContextLeave {
                time,
                calling_context,
            } => {
                out.write_u8(TAG_LEAVE)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(calling_context.0)?;
            }
            Event::CallingContextSample {
                time,
                calling_context,
                unwind_distance,
                interrupt_generator,
            } => {
                out.write_u8(TAG_SAMPLE)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(calling_context.0)?;
                out.write_u32::<NativeEndian>(*unwind_distance)?;
                out.write_u32::<NativeEndian>(interrupt_generator.0)?;
            }
            Event::ThreadBegin { time, comm } => {
                out.write_u8(TAG_THREAD_BEGIN)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(comm.0)?;
            }
            Event::ThreadEnd { time, comm } => {
                out.write_u8(TAG_THREAD_END)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(comm.0)?;
            }
            Event::Metric {
                time,
                instance,
                values,
            } => {
                out.write_u8(TAG_METRIC)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(instance.0)?;
                out.write_u32::<NativeEndian>(values.len() as u32)?;
                for value in values {
                    match value {
                        MetricValue::Int(v) => {
                            out.write_u8(0)?;
                            out.write_i64::<NativeEndian>(*v)?;
                        }
                        MetricValue::Uint(v) => {
                            out.write_u8(1)?;
                            out.write_u64::<NativeEndian>(*v)?;
                        }
                        MetricValue::Double(v) => {
                            out.write_u8(2)?;
                            out.write_f64::<NativeEndian>(*v)?;
                        }
                    }
                }
            }
            Event::IoCreateHandle { time, handle } => {
                out.write_u8(TAG_IO_CREATE_HANDLE)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(handle.0)?;
            }
            Event::IoDestroyHandle { time, handle } => {
                out.write_u8(TAG_IO_DESTROY_HANDLE)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(handle.0)?;
            }
            Event::IoOperationBegin {
                time,
                handle,
                mode,
                bytes,
                matching_id,
            } => {
                out.write_u8(TAG_IO_OPERATION_BEGIN)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(handle.0)?;
                out.write_u8(io_mode_byte(*mode))?;
                out.write_u64::<NativeEndian>(*bytes)?;
                out.write_u64::<NativeEndian>(*matching_id)?;
            }
            Event::IoOperationIssued {
                time,
                handle,
                matching_id,
            } => {
                out.write_u8(TAG_IO_OPERATION_ISSUED)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(handle.0)?;
                out.write_u64::<NativeEndian>(*matching_id)?;
            }
            Event::IoOperationComplete {
                time,
                handle,
                bytes,
                matching_id,
            } => {
                out.write_u8(TAG_IO_OPERATION_COMPLETE)?;
                out.write_u64::<NativeEndian>(time.nanos())?;
                out.write_u32::<NativeEndian>(handle.0)?;
                out.write_u64::<NativeEndian>(*bytes)?;
                out.write_u64::<NativeEndian>(*matching_id)?;
            }
        }
        Ok(())
    }

    fn mapping_table(&mut self, table: &[u32]) -> io::Result<()> {
        self.out.write_u8(TAG_MAPPING_TABLE)?;
        self.out.write_u32::<NativeEndian>(table.len() as u32)?;
        for entry in table {
            self.out.write_u32::<NativeEndian>(*entry)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Collects events in memory; the test double for `FileSink`.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    pub events: std::sync::Arc<parking_lot::Mutex<Vec<Event>>>,
    pub mapping_tables: std::sync::Arc<parking_lot::Mutex<Vec<Vec<u32>>>>,
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn event(&mut self, event: &Event) -> io::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn mapping_table(&mut self, table: &[u32]) -> io::Result<()> {
        self.mapping_tables.lock().push(table.to_vec());
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_with_recorder() -> (EventWriter, std::sync::Arc<parking_lot::Mutex<Vec<Event>>>) {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        (EventWriter::new(LocationRef(0), Box::new(sink)), events)
    }

    #[test]
    fn out_of_order_timestamps_are_clamped_forward() {
        let (mut writer, events) = writer_with_recorder();
        for raw in [100, 90, 110] {
            writer.write(Event::CallingContextLeave {
                time: Timestamp(raw),
                calling_context: CallingContextRef(0),
            });
        }
        let times: Vec<u64> = events.lock().iter().map(|e| e.time().nanos()).collect();
        assert_eq!(times, vec![100, 100, 110]);
    }

    #[test]
    fn file_sink_roundtrips_tags() {
        let mut sink = FileSink::new(Vec::new());
        sink.event(&Event::CallingContextSample {
            time: Timestamp(42),
            calling_context: CallingContextRef(7),
            unwind_distance: 2,
            interrupt_generator: InterruptGeneratorRef(0),
        })
        .unwrap();
        sink.mapping_table(&[0, 1, 2]).unwrap();
        sink.finish().unwrap();
        let bytes = sink.out.into_inner().unwrap();
        assert_eq!(bytes[0], TAG_SAMPLE);
        // tag + ts + ref + distance + generator, then the mapping table
        let table_start = 1 + 8 + 4 + 4 + 4;
        assert_eq!(bytes[table_start], TAG_MAPPING_TABLE);
        assert_eq!(bytes.len(), table_start + 1 + 4 + 3 * 4);
    }
}
