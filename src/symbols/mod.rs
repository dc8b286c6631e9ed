//! Resolution of sampled instruction pointers to functions, source lines and
//! instructions: per-process overlays of address-range mappings, each backed
//! by a symbol resolver.

pub mod map;
pub mod process_map;
pub mod resolver;

pub use map::MemoryMap;
pub use process_map::{ProcessMap, Resolvers};
pub use resolver::{FunctionResolver, InstructionResolver};

use std::path::Path;

use crate::address::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no mapping found for address {0}")]
pub struct LookupError(pub Address);

/// A resolved source location: function, file, line and the defining DSO.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineInfo {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub dso: String,
}

pub const UNKNOWN: &str = "(unknown)";

impl LineInfo {
    pub fn new(function: &str, file: &str, line: u32, dso: &str) -> LineInfo {
        LineInfo {
            function: function.to_owned(),
            file: file.to_owned(),
            // Viewers drop regions without a line, write 1 when unknown.
            line: if line == 0 { 1 } else { line },
            dso: Path::new(dso)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dso.to_owned()),
        }
    }

    /// Fallback for an address with no mapping at all.
    pub fn for_address(addr: Address) -> LineInfo {
        LineInfo::new(&format!("?@{addr}"), UNKNOWN, 0, UNKNOWN)
    }

    /// Fallback for an address inside a known binary without symbol info.
    pub fn for_unknown_function_in(addr: Address, dso: &str) -> LineInfo {
        LineInfo::new(&format!("?@{addr}"), UNKNOWN, 0, dso)
    }

    /// A pseudo source location that just names the binary, used for
    /// bracketed pseudo-mappings like `[vdso]`.
    pub fn for_binary(name: &str) -> LineInfo {
        LineInfo::new(name, name, 0, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_zero_becomes_one() {
        let info = LineInfo::new("f", "file.c", 0, "/usr/lib/libc.so.6");
        assert_eq!(info.line, 1);
        assert_eq!(info.dso, "libc.so.6");
    }

    #[test]
    fn address_fallback_names_the_address() {
        let info = LineInfo::for_address(Address(0x1234));
        assert_eq!(info.function, "?@0x1234");
        assert_eq!(info.file, UNKNOWN);
    }
}
