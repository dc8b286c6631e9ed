//! Recording of arbitrary kernel tracepoints as metrics: every hit becomes
//! one metric event carrying the tracepoint's numeric fields.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{MonitorHandle, PollSet};
use crate::clock::ClockConverter;
use crate::config::Config;
use crate::otf2::{Event, EventWriter, LocationType, MetricInstanceRef, MetricValue};
use crate::perf::ring_buffer::RecordHandler;
use crate::perf::tracepoint::{TracepointField, TracepointFormat};
use crate::perf::{EventAttr, EventGuard, OpenTarget, RingBuffer, SampleParser};
use crate::trace::Trace;
use crate::types::{Cpu, MeasurementScope};

struct TracepointSource {
    guard: EventGuard,
    ring: RingBuffer,
    parser: SampleParser,
    fields: Vec<TracepointField>,
    instance: MetricInstanceRef,
}

/// One monitor per CPU, draining all configured tracepoint events of that
/// CPU into one metric writer.
pub struct TracepointMonitor {
    cpu: Cpu,
    converter: ClockConverter,
    writer: EventWriter,
    sources: Vec<TracepointSource>,
}

impl TracepointMonitor {
    pub fn create(
        trace: Arc<Trace>,
        converter: ClockConverter,
        cpu: Cpu,
        config: &Config,
    ) -> Option<TracepointMonitor> {
        let writer = trace
            .create_writer(
                MeasurementScope::tracepoint(cpu.as_scope()),
                LocationType::Metric,
            )
            .ok()?;

        let mut sources = Vec::new();
        for event in &config.tracepoint_events {
            let format = match TracepointFormat::by_name(event) {
                Ok(format) => format,
                Err(err) => {
                    log::warn!("skipping tracepoint '{event}': {err}");
                    continue;
                }
            };
            // Only fixed-width integer fields are representable as metric
            // members; the common_* bookkeeping fields are not interesting.
            let fields: Vec<TracepointField> = format
                .fields
                .iter()
                .filter(|field| {
                    !field.name.starts_with("common_") && matches!(field.size, 1 | 2 | 4 | 8)
                })
                .cloned()
                .collect();
            if fields.is_empty() {
                log::warn!("tracepoint '{event}' has no usable fields, skipping");
                continue;
            }

            let mut attr = match EventAttr::tracepoint(event) {
                Ok(attr) => attr,
                Err(err) => {
                    log::warn!("skipping tracepoint '{event}': {err}");
                    continue;
                }
            };
            attr.set_clockid(config.clockid);
            attr.set_disabled();
            let guard = match attr.open(OpenTarget::Cpu(cpu), None, config.cgroup_fd) {
                Ok(guard) => guard,
                Err(err) => {
                    log::warn!("failed to open tracepoint '{event}' on {cpu}: {err}");
                    continue;
                }
            };
            if guard.set_nonblocking().is_err() {
                continue;
            }
            let Ok(ring) = RingBuffer::new(guard.fd(), config.mmap_pages) else {
                continue;
            };

            let members: Vec<(String, String)> = fields
                .iter()
                .map(|field| (format!("{}::{}", format.name, field.name), "#".to_owned()))
                .collect();
            let class = trace.metric_class(&members);
            let instance = trace.metric_instance(class, writer.location(), writer.location());

            sources.push(TracepointSource {
                parser: SampleParser::new(attr.sample_type()),
                guard,
                ring,
                fields,
                instance,
            });
        }

        if sources.is_empty() {
            return None;
        }
        Some(TracepointMonitor {
            cpu,
            converter,
            writer,
            sources,
        })
    }

    pub fn spawn(self) -> MonitorHandle {
        let name = format!("tracepoints {}", self.cpu);
        super::spawn(&name, move |stop| self.run(stop))
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
        self.writer.finish();
    }

    fn drain(&mut self) {
        for source in &mut self.sources {
            let mut handler = TracepointHandler {
                converter: &self.converter,
                parser: &source.parser,
                fields: &source.fields,
                writer: &mut self.writer,
                instance: source.instance,
            };
            source.ring.drain(&mut handler);
        }
    }
}

struct TracepointHandler<'a> {
    converter: &'a ClockConverter,
    parser: &'a SampleParser,
    fields: &'a [TracepointField],
    writer: &'a mut EventWriter,
    instance: MetricInstanceRef,
}

impl RecordHandler for TracepointHandler<'_> {
    fn handle_sample(&mut self, data: &[u8], _misc: u16) {
        let Some(sample) = self.parser.parse(data) else {
            return;
        };
        let (Some(time), Some(raw)) = (sample.time, &sample.raw) else {
            return;
        };
        let time = self.converter.convert(time);
        let time = self.writer.adjust_time(time);

        let values = self
            .fields
            .iter()
            .map(|field| {
                let value = field.read(raw).unwrap_or(0);
                if field.signed {
                    MetricValue::Int(value as i64)
                } else {
                    MetricValue::Uint(value)
                }
            })
            .collect();
        self.writer.write(Event::Metric {
            time,
            instance: self.instance,
            values,
        });
    }
}
