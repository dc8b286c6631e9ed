//! Parsing of sysfs PMU descriptions under `/sys/bus/event_source/devices`.

use std::fs;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use super::EventError;
use crate::types::Cpu;

const SYSFS_PMU_ROOT: &str = "/sys/bus/event_source/devices";

/// One PMU as described by sysfs: its perf type id, its `format/` bitmask
/// vocabulary, and the CPUs it can be opened on (uncore PMUs list them in
/// `cpus` or `cpumask`).
#[derive(Debug, Clone)]
pub struct Pmu {
    pub name: String,
    pub type_id: u32,
    pub formats: FxHashMap<String, FormatTerm>,
    pub cpus: Option<Vec<Cpu>>,
    path: PathBuf,
}

/// Where the value of one event term lands: which attr field, spread over
/// which bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatTerm {
    pub target: FormatTarget,
    pub mask: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTarget {
    Config,
    Config1,
    Config2,
}

impl Pmu {
    pub fn open(name: &str) -> Result<Pmu, EventError> {
        Self::open_at(Path::new(SYSFS_PMU_ROOT), name)
    }

    fn open_at(root: &Path, name: &str) -> Result<Pmu, EventError> {
        let path = root.join(name);
        let type_id: u32 = read_trimmed(&path.join("type"))
            .ok_or_else(|| EventError::InvalidEvent(format!("unknown PMU '{name}'")))?
            .parse()
            .map_err(|_| EventError::InvalidEvent(format!("unreadable type file of PMU '{name}'")))?;

        let mut formats = FxHashMap::default();
        if let Ok(entries) = fs::read_dir(path.join("format")) {
            for entry in entries.flatten() {
                let term = entry.file_name().to_string_lossy().into_owned();
                let Some(description) = read_trimmed(&entry.path()) else {
                    continue;
                };
                match parse_format(&description) {
                    Ok(format) => {
                        formats.insert(term, format);
                    }
                    Err(err) => {
                        log::debug!("ignoring format term {term} of PMU {name}: {err}");
                    }
                }
            }
        }

        let cpus = read_trimmed(&path.join("cpus"))
            .or_else(|| read_trimmed(&path.join("cpumask")))
            .map(|list| parse_cpu_list(&list))
            .transpose()?;

        Ok(Pmu {
            name: name.to_owned(),
            type_id,
            formats,
            cpus,
            path,
        })
    }

    pub fn names() -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(SYSFS_PMU_ROOT) {
            for entry in entries.flatten() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        names
    }

    /// The `events/<name>` description, e.g. `event=0x3c,umask=0x00`.
    pub fn event_description(&self, event: &str) -> Result<String, EventError> {
        read_trimmed(&self.path.join("events").join(event)).ok_or_else(|| {
            EventError::InvalidEvent(format!("PMU '{}' has no event '{event}'", self.name))
        })
    }

    pub fn event_scale(&self, event: &str) -> Option<f64> {
        read_trimmed(&self.path.join("events").join(format!("{event}.scale")))?
            .parse()
            .ok()
    }

    pub fn event_unit(&self, event: &str) -> Option<String> {
        read_trimmed(&self.path.join("events").join(format!("{event}.unit")))
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    let data = fs::read_to_string(path).ok()?;
    let data = data.trim();
    if data.is_empty() {
        None
    } else {
        Some(data.to_owned())
    }
}

/// Parses a `format/` entry such as `config:0-7,32-35` into target + bitmask.
pub fn parse_format(description: &str) -> Result<FormatTerm, EventError> {
    let (target, bits) = description
        .split_once(':')
        .ok_or_else(|| EventError::InvalidEvent(format!("format without colon: '{description}'")))?;

    let target = match target {
        "config" => FormatTarget::Config,
        "config1" => FormatTarget::Config1,
        "config2" => FormatTarget::Config2,
        other => {
            return Err(EventError::InvalidEvent(format!(
                "unsupported format target '{other}'"
            )))
        }
    };

    Ok(FormatTerm {
        target,
        mask: parse_bitmask(bits)?,
    })
}

/// Parses a bit list like `0-7,32-35` or `23` into a mask.
pub fn parse_bitmask(bits: &str) -> Result<u64, EventError> {
    let mut mask = 0u64;
    for part in bits.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (start, end) = match part.split_once('-') {
            Some((s, e)) => (parse_bit(s)?, parse_bit(e)?),
            None => {
                let bit = parse_bit(part)?;
                (bit, bit)
            }
        };
        if start > end || end > 63 {
            return Err(EventError::InvalidEvent(format!("invalid bit range '{part}'")));
        }
        let len = end - start + 1;
        let bits = if len == 64 { u64::MAX } else { (1u64 << len) - 1 };
        mask |= bits << start;
    }
    Ok(mask)
}

fn parse_bit(s: &str) -> Result<u32, EventError> {
    s.trim()
        .parse()
        .map_err(|_| EventError::InvalidEvent(format!("invalid bit position '{s}'")))
}

/// Spreads `value` over the set bits of `mask`, lowest first. A umask term
/// with `config:8-15` and value `0x01` lands in config bits 8..16.
pub fn apply_mask(value: u64, mask: u64) -> u64 {
    let mut result = 0u64;
    let mut value_bit = 0;
    for mask_bit in 0..64 {
        if mask & (1 << mask_bit) != 0 {
            result |= ((value >> value_bit) & 1) << mask_bit;
            value_bit += 1;
        }
    }
    result
}

/// Parses a sysfs CPU list: comma-separated integers or ranges (`0-3,8`).
pub fn parse_cpu_list(list: &str) -> Result<Vec<Cpu>, EventError> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start: i32 = start.trim().parse().map_err(|_| bad_cpu_list(list))?;
                let end: i32 = end.trim().parse().map_err(|_| bad_cpu_list(list))?;
                if start > end {
                    return Err(bad_cpu_list(list));
                }
                cpus.extend((start..=end).map(Cpu));
            }
            None => cpus.push(Cpu(part.parse().map_err(|_| bad_cpu_list(list))?)),
        }
    }
    Ok(cpus)
}

fn bad_cpu_list(list: &str) -> EventError {
    EventError::InvalidEvent(format!("invalid cpu list '{list}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_single_bit() {
        assert_eq!(parse_bitmask("23").unwrap(), 1 << 23);
    }

    #[test]
    fn bitmask_ranges() {
        assert_eq!(parse_bitmask("0-7").unwrap(), 0xff);
        assert_eq!(parse_bitmask("1-3").unwrap(), 0b1110);
        assert_eq!(parse_bitmask("0-7,32-35").unwrap(), 0xf_0000_00ff);
        assert_eq!(parse_bitmask("0-63").unwrap(), u64::MAX);
    }

    #[test]
    fn bitmask_rejects_garbage() {
        assert!(parse_bitmask("7-1").is_err());
        assert!(parse_bitmask("0-64").is_err());
        assert!(parse_bitmask("x").is_err());
    }

    #[test]
    fn apply_mask_spreads_value() {
        assert_eq!(apply_mask(0b101, 0b1110), 0b1010);
        assert_eq!(apply_mask(0xff, 0xff00), 0xff00);
        assert_eq!(apply_mask(0x3, 0x1 | (1 << 32)), 0x1_0000_0001);
    }

    #[test]
    fn format_parse() {
        let term = parse_format("config:0-7").unwrap();
        assert_eq!(term.target, FormatTarget::Config);
        assert_eq!(term.mask, 0xff);
        let term = parse_format("config1:49").unwrap();
        assert_eq!(term.target, FormatTarget::Config1);
        assert_eq!(term.mask, 1 << 49);
        assert!(parse_format("nonsense").is_err());
    }

    #[test]
    fn cpu_list_parse() {
        assert_eq!(parse_cpu_list("0").unwrap(), vec![Cpu(0)]);
        assert_eq!(
            parse_cpu_list("0-2,8").unwrap(),
            vec![Cpu(0), Cpu(1), Cpu(2), Cpu(8)]
        );
        assert!(parse_cpu_list("3-1").is_err());
    }
}
