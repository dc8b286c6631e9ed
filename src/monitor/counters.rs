//! Periodic counter readings: a perf event group read as one unit, and
//! userspace counters read from files.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::otf2::{
    Event, EventWriter, LocationType, MetricInstanceRef, MetricValue, Timestamp,
};
use crate::perf::{EventAttr, EventGuard, OpenTarget};
use crate::trace::Trace;
use crate::types::{ExecutionScope, MeasurementScope};

struct Member {
    guard: EventGuard,
    scale: f64,
    last_raw: u64,
    accumulated: f64,
}

/// A group of counters behind one leader, read with `PERF_FORMAT_GROUP` so
/// all values come from the same instant. Multiplexed groups are scaled by
/// time-enabled over time-running.
pub struct CounterSet {
    leader: EventGuard,
    members: Vec<Member>,
    writer: EventWriter,
    instance: MetricInstanceRef,
    last_enabled: u64,
    last_running: u64,
    read_buf: Vec<u64>,
}

impl CounterSet {
    /// Opens the configured group counters on `scope`. Events that turn out
    /// unavailable are dropped with a log message; measurement continues.
    pub fn open(
        trace: &Arc<Trace>,
        scope: ExecutionScope,
        config: &Config,
    ) -> Option<CounterSet> {
        if config.group_counters.is_empty() {
            return None;
        }

        let mut leader_attr = match EventAttr::resolve(&config.metric_leader) {
            Ok(attr) => attr,
            Err(err) => {
                log::error!(
                    "cannot use '{}' as metric leader: {err}",
                    config.metric_leader
                );
                return None;
            }
        };
        if !leader_attr.is_available_in(scope) {
            log::warn!(
                "metric leader '{}' is not available for {scope}",
                config.metric_leader
            );
            return None;
        }

        leader_attr.set_disabled();
        leader_attr.set_clockid(config.clockid);
        if config.exclude_kernel {
            leader_attr.set_exclude_kernel();
        }
        match (config.metric_count, config.metric_frequency) {
            (Some(count), _) => leader_attr.sample_period(count),
            (None, Some(freq)) => leader_attr.sample_freq(freq),
            (None, None) => leader_attr.sample_freq(10),
        }

        let target = OpenTarget::from(scope);
        let leader = match leader_attr.open_as_group_leader(target, config.cgroup_fd) {
            Ok(leader) => leader,
            Err(err) => {
                log::error!("failed to open metric leader for {scope}: {err}");
                return None;
            }
        };

        let mut members = Vec::new();
        let mut class_members = Vec::new();
        for name in &config.group_counters {
            let mut attr = match EventAttr::resolve(name) {
                Ok(attr) => attr,
                Err(err) => {
                    log::warn!("skipping counter '{name}': {err}");
                    continue;
                }
            };
            if !attr.is_available_in(scope) {
                log::debug!("counter '{name}' is not available for {scope}");
                continue;
            }
            if config.exclude_kernel {
                attr.set_exclude_kernel();
            }
            match attr.open(target, Some(&leader), config.cgroup_fd) {
                Ok(guard) => {
                    class_members.push((attr.name().to_owned(), attr.unit().to_owned()));
                    members.push(Member {
                        guard,
                        scale: attr.scale(),
                        last_raw: 0,
                        accumulated: 0.0,
                    });
                }
                Err(err) => {
                    log::warn!("failed to open counter '{name}' for {scope}: {err}");
                }
            }
        }

        if members.is_empty() {
            return None;
        }

        let class = trace.metric_class(&class_members);
        let writer = trace
            .create_writer(MeasurementScope::group_metric(scope), LocationType::Metric)
            .ok()?;
        let instance = trace.metric_instance(class, writer.location(), writer.location());

        if let Err(err) = leader.enable() {
            log::error!("failed to enable counter group for {scope}: {err}");
            return None;
        }

        // nr + time_enabled + time_running + leader value + member values
        let read_buf = vec![0u64; 4 + members.len()];
        Some(CounterSet {
            leader,
            members,
            writer,
            instance,
            last_enabled: 0,
            last_running: 0,
            read_buf,
        })
    }

    /// Group-reads all members and emits one metric event.
    pub fn read_and_write(&mut self, time: Timestamp) {
        // Layout with FORMAT_GROUP | TOTAL_TIME_ENABLED | TOTAL_TIME_RUNNING:
        // nr, time_enabled, time_running, value[nr]
        let words = match self.leader.read_group(&mut self.read_buf) {
            Ok(words) => words,
            Err(err) => {
                log::debug!("group read failed: {err}");
                return;
            }
        };
        if words < 3 {
            return;
        }
        let nr = self.read_buf[0] as usize;
        let enabled = self.read_buf[1];
        let running = self.read_buf[2];
        if words < 3 + nr || nr != self.members.len() + 1 {
            // The leader itself is value[0]; members follow.
            log::debug!("unexpected group read layout: nr={nr}, words={words}");
            return;
        }

        let enabled_delta = enabled.saturating_sub(self.last_enabled);
        let running_delta = running.saturating_sub(self.last_running);
        self.last_enabled = enabled;
        self.last_running = running;
        // When the group was descheduled the whole interval, values did not
        // move; correction is meaningless then.
        let correction = if running_delta > 0 {
            enabled_delta as f64 / running_delta as f64
        } else {
            1.0
        };

        let mut values = Vec::with_capacity(self.members.len());
        for (i, member) in self.members.iter_mut().enumerate() {
            let raw = self.read_buf[3 + 1 + i];
            let delta = raw.saturating_sub(member.last_raw);
            member.last_raw = raw;
            member.accumulated += delta as f64 * correction * member.scale;
            values.push(MetricValue::Double(member.accumulated));
        }

        self.writer.write(Event::Metric {
            time,
            instance: self.instance,
            values,
        });
    }

    pub fn finish(mut self) {
        let _ = self.leader.disable();
        self.writer.finish();
    }
}

/// Counters read from plain files (one numeric value per read), sampled on
/// the same timer as the perf group.
pub struct UserspaceCounters {
    paths: Vec<PathBuf>,
    writer: EventWriter,
    instance: MetricInstanceRef,
}

impl UserspaceCounters {
    pub fn open(
        trace: &Arc<Trace>,
        scope: ExecutionScope,
        config: &Config,
    ) -> Option<UserspaceCounters> {
        if config.userspace_counters.is_empty() {
            return None;
        }
        let members: Vec<(String, String)> = config
            .userspace_counters
            .iter()
            .map(|path| (path.display().to_string(), "#".to_owned()))
            .collect();
        let class = trace.metric_class(&members);
        let writer = trace
            .create_writer(
                MeasurementScope::userspace_metric(scope),
                LocationType::Metric,
            )
            .ok()?;
        let instance = trace.metric_instance(class, writer.location(), writer.location());
        Some(UserspaceCounters {
            paths: config.userspace_counters.clone(),
            writer,
            instance,
        })
    }

    pub fn read_and_write(&mut self, time: Timestamp) {
        let values = self
            .paths
            .iter()
            .map(|path| {
                let value = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|content| content.trim().parse::<f64>().ok())
                    .unwrap_or(0.0);
                MetricValue::Double(value)
            })
            .collect();
        self.writer.write(Event::Metric {
            time,
            instance: self.instance,
            values,
        });
    }

    pub fn finish(mut self) {
        self.writer.finish();
    }
}
