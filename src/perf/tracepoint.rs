//! Kernel tracepoint ids and record schemas from
//! `/sys/kernel/tracing/events/<group>/<name>/{id,format}`.

use std::fs;
use std::path::PathBuf;

use super::EventError;

const TRACING_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracepointField {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub signed: bool,
}

impl TracepointField {
    /// Reads the field out of one raw tracepoint record, sign- or
    /// zero-extended to 64 bits. Fields wider than 8 bytes (strings, arrays)
    /// are not integers; use `bytes` for those.
    pub fn read(&self, data: &[u8]) -> Option<u64> {
        let bytes = self.bytes(data)?;
        let mut buf = [0u8; 8];
        match bytes.len() {
            1 | 2 | 4 | 8 => buf[..bytes.len()].copy_from_slice(bytes),
            _ => return None,
        }
        let mut value = u64::from_ne_bytes(buf);
        if self.signed && self.size < 8 {
            let shift = 64 - self.size * 8;
            value = (((value << shift) as i64) >> shift) as u64;
        }
        Some(value)
    }

    pub fn bytes<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        data.get(self.offset..self.offset + self.size)
    }
}

#[derive(Debug, Clone)]
pub struct TracepointFormat {
    pub name: String,
    pub id: u64,
    pub fields: Vec<TracepointField>,
}

impl TracepointFormat {
    /// Looks up `group:name` (or `group/name`) under the tracefs mount.
    pub fn by_name(event: &str) -> Result<TracepointFormat, EventError> {
        let (group, name) = event
            .split_once(':')
            .or_else(|| event.split_once('/'))
            .ok_or_else(|| {
                EventError::InvalidEvent(format!("tracepoint '{event}' is not of the form group:name"))
            })?;

        let dir = TRACING_ROOTS
            .iter()
            .map(|root| PathBuf::from(root).join("events").join(group).join(name))
            .find(|p| p.is_dir())
            .ok_or_else(|| EventError::InvalidEvent(format!("unknown tracepoint '{event}'")))?;

        let id = fs::read_to_string(dir.join("id"))
            .map_err(|_| EventError::InvalidEvent(format!("unreadable id file for '{event}'")))?
            .trim()
            .parse()
            .map_err(|_| EventError::InvalidEvent(format!("malformed id file for '{event}'")))?;

        let format = fs::read_to_string(dir.join("format"))
            .map_err(|_| EventError::InvalidEvent(format!("unreadable format file for '{event}'")))?;

        Ok(TracepointFormat {
            name: event.replace('/', ":"),
            id,
            fields: parse_format_fields(&format),
        })
    }

    pub fn field(&self, name: &str) -> Result<&TracepointField, EventError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| {
                EventError::InvalidEvent(format!("tracepoint '{}' has no field '{name}'", self.name))
            })
    }
}

fn parse_format_fields(format: &str) -> Vec<TracepointField> {
    let mut fields = Vec::new();
    for line in format.lines() {
        let line = line.trim();
        if !line.starts_with("field:") {
            continue;
        }

        let mut name = None;
        let mut offset = None;
        let mut size = None;
        let mut signed = false;
        for part in line.split(';') {
            let part = part.trim();
            if let Some(decl) = part.strip_prefix("field:") {
                // The declaration is a C declarator; the field name is the
                // last identifier, minus any array suffix.
                let last = decl.split_whitespace().last().unwrap_or(decl);
                let last = last.split('[').next().unwrap_or(last);
                name = Some(last.trim_start_matches('*').to_owned());
            } else if let Some(v) = part.strip_prefix("offset:") {
                offset = v.parse().ok();
            } else if let Some(v) = part.strip_prefix("size:") {
                size = v.parse().ok();
            } else if let Some(v) = part.strip_prefix("signed:") {
                signed = v == "1";
            }
        }

        if let (Some(name), Some(offset), Some(size)) = (name, offset, size) {
            fields.push(TracepointField {
                name,
                offset,
                size,
                signed,
            });
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_RQ_FORMAT: &str = "\
name: block_rq_insert
ID: 1355
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:dev_t dev;\toffset:8;\tsize:4;\tsigned:0;
\tfield:sector_t sector;\toffset:16;\tsize:8;\tsigned:0;
\tfield:unsigned int nr_sector;\toffset:24;\tsize:4;\tsigned:0;
\tfield:unsigned int bytes;\toffset:28;\tsize:4;\tsigned:0;
\tfield:char rwbs[8];\toffset:32;\tsize:8;\tsigned:0;

print fmt: \"%d,%d %s ...\"
";

    #[test]
    fn parses_fields() {
        let fields = parse_format_fields(BLOCK_RQ_FORMAT);
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "common_type",
                "common_flags",
                "common_preempt_count",
                "common_pid",
                "dev",
                "sector",
                "nr_sector",
                "bytes",
                "rwbs"
            ]
        );

        let sector = &fields[5];
        assert_eq!(sector.offset, 16);
        assert_eq!(sector.size, 8);
        assert!(!sector.signed);

        let pid = &fields[3];
        assert!(pid.signed);
    }

    #[test]
    fn reads_field_values() {
        let fields = parse_format_fields(BLOCK_RQ_FORMAT);
        let mut record = vec![0u8; 40];
        record[8..12].copy_from_slice(&0x0080_0010u32.to_ne_bytes());
        record[16..24].copy_from_slice(&4096u64.to_ne_bytes());
        record[4..8].copy_from_slice(&(-5i32).to_ne_bytes());

        let dev = fields.iter().find(|f| f.name == "dev").unwrap();
        assert_eq!(dev.read(&record), Some(0x0080_0010));
        let sector = fields.iter().find(|f| f.name == "sector").unwrap();
        assert_eq!(sector.read(&record), Some(4096));
        let pid = fields.iter().find(|f| f.name == "common_pid").unwrap();
        assert_eq!(pid.read(&record), Some((-5i64) as u64));
    }

    #[test]
    fn short_record_is_rejected() {
        let fields = parse_format_fields(BLOCK_RQ_FORMAT);
        let sector = fields.iter().find(|f| f.name == "sector").unwrap();
        assert_eq!(sector.read(&[0u8; 10]), None);
    }
}
