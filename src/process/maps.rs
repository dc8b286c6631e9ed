//! Parsing of `/proc/<pid>/maps`.

use crate::address::Address;
use crate::types::Process;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub start: Address,
    pub end: Address,
    pub is_executable: bool,
    pub file_offset: Address,
    pub name: String,
}

/// Reads and parses the memory map of a live process. Supposedly the
/// per-task file is faster than `/proc/<pid>/maps` for processes with many
/// threads.
pub fn read_maps(process: Process) -> Vec<Region> {
    let pid = process.as_raw();
    let path = format!("/proc/{pid}/task/{pid}/maps");
    match std::fs::read_to_string(&path) {
        Ok(content) => parse(&content),
        Err(err) => {
            log::debug!("could not read {path}: {err}");
            Vec::new()
        }
    }
}

pub fn parse(maps: &str) -> Vec<Region> {
    let mut output = Vec::new();
    for line in maps.lines() {
        if let Some(region) = parse_line(line) {
            output.push(region);
        }
    }
    output
}

fn parse_line(line: &str) -> Option<Region> {
    // start-end perms offset dev inode       name
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let name = parts.next().unwrap_or("").to_owned();

    let (start, end) = range.split_once('-')?;
    Some(Region {
        start: Address(u64::from_str_radix(start, 16).ok()?),
        end: Address(u64::from_str_radix(end, 16).ok()?),
        is_executable: perms.as_bytes().get(2) == Some(&b'x'),
        file_offset: Address(u64::from_str_radix(offset, 16).ok()?),
        name,
    })
}

#[test]
fn test_parse() {
    let maps = "\
00400000-0040c000 r-xp 00000000 08:02 1321238                            /usr/bin/cat
0060d000-0062e000 rw-p 00000000 00:00 0                                  [heap]
7ffff672c000-7ffff69db000 r--s 00001ac2 1f:33 1335289                    /usr/lib/locale/locale-archive
7ffff5600000-7ffff5800000 rw-p 00000000 00:00 0
";

    assert_eq!(
        parse(maps),
        vec![
            Region {
                start: Address(0x00400000),
                end: Address(0x0040c000),
                is_executable: true,
                file_offset: Address(0),
                name: "/usr/bin/cat".to_owned(),
            },
            Region {
                start: Address(0x0060d000),
                end: Address(0x0062e000),
                is_executable: false,
                file_offset: Address(0),
                name: "[heap]".to_owned(),
            },
            Region {
                start: Address(0x7ffff672c000),
                end: Address(0x7ffff69db000),
                is_executable: false,
                file_offset: Address(0x1ac2),
                name: "/usr/lib/locale/locale-archive".to_owned(),
            },
            Region {
                start: Address(0x7ffff5600000),
                end: Address(0x7ffff5800000),
                is_executable: false,
                file_offset: Address(0),
                name: "".to_owned(),
            },
        ]
    );
}

#[test]
fn test_parse_garbage() {
    assert_eq!(parse(""), vec![]);
    assert_eq!(parse("not a maps line\n"), vec![]);
}
