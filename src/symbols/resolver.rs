//! Symbol resolver backends: DWARF line info, the ELF symbol table, the
//! in-kernel `kallsyms`, JIT `perf-<pid>.map` files, and a name-echo stub.

use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{LineInfo, LookupError};
use crate::address::Address;
use crate::types::Process;

/// Maps a file-relative offset (or an absolute address, depending on how the
/// overlay mapping is set up) to a source location.
pub trait FunctionResolver: Send + Sync {
    fn lookup_line_info(&self, offset: Address) -> Option<LineInfo>;
    fn name(&self) -> &str;
}

/// Best-effort disassembly of one instruction. The concrete disassembler is
/// an external collaborator; callers must cope with `Err` and substitute an
/// unknown-instruction marker.
pub trait InstructionResolver: Send + Sync {
    fn lookup_instruction(&self, offset: Address) -> Result<String, LookupError>;
}

pub struct UnknownInstructionResolver;

impl InstructionResolver for UnknownInstructionResolver {
    fn lookup_instruction(&self, offset: Address) -> Result<String, LookupError> {
        Err(LookupError(offset))
    }
}

fn demangle(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        // The alternate form drops the trailing hash.
        return format!("{demangled:#}");
    }
    if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
        if let Ok(demangled) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
            return demangled;
        }
    }
    name.to_owned()
}

/// Echoes a fixed name for every address. Used for bracketed pseudo-files
/// (`[vdso]`, `[heap]`, ...) and as the terminal fallback when no backend
/// could be initialized.
pub struct StubResolver {
    name: String,
}

impl StubResolver {
    pub fn new(name: &str) -> StubResolver {
        StubResolver {
            name: name.to_owned(),
        }
    }
}

impl FunctionResolver for StubResolver {
    fn lookup_line_info(&self, _offset: Address) -> Option<LineInfo> {
        Some(LineInfo::for_binary(&self.name))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// DWARF line info via addr2line, with per-address memoization. Lookups
/// take file-relative offsets.
pub struct DwarfResolver {
    name: String,
    loader: addr2line::Loader,
    cache: Mutex<FxHashMap<u64, Option<LineInfo>>>,
}

// addr2line::Loader is not Sync by itself; all lookups go through the cache
// mutex below.
unsafe impl Send for DwarfResolver {}
unsafe impl Sync for DwarfResolver {}

impl DwarfResolver {
    pub fn open(path: &str) -> Result<DwarfResolver, String> {
        let loader = addr2line::Loader::new(path).map_err(|e| e.to_string())?;
        Ok(DwarfResolver {
            name: path.to_owned(),
            loader,
            cache: Mutex::new(FxHashMap::default()),
        })
    }
}

impl FunctionResolver for DwarfResolver {
    fn lookup_line_info(&self, offset: Address) -> Option<LineInfo> {
        let mut cache = self.cache.lock();
        cache
            .entry(offset.value())
            .or_insert_with(|| {
                let location = self.loader.find_location(offset.value()).ok()??;
                let function = self
                    .loader
                    .find_symbol(offset.value())
                    .map(demangle)
                    .unwrap_or_else(|| format!("?@{offset}"));
                Some(LineInfo::new(
                    &function,
                    location.file.unwrap_or(super::UNKNOWN),
                    location.line.unwrap_or(0),
                    &self.name,
                ))
            })
            .clone()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// ELF symbol table lookup, the fallback when a binary carries no usable
/// DWARF. Function names only, no files or lines.
pub struct SymtabResolver {
    name: String,
    // (value, size, demangled name), sorted by value.
    symbols: Vec<(u64, u64, String)>,
}

impl SymtabResolver {
    pub fn open(path: &str) -> Result<SymtabResolver, String> {
        use object::{Object, ObjectSymbol};

        let file = fs::File::open(path).map_err(|e| e.to_string())?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| e.to_string())?;
        let object = object::File::parse(&*mmap).map_err(|e| e.to_string())?;

        let mut symbols: Vec<(u64, u64, String)> = object
            .symbols()
            .chain(object.dynamic_symbols())
            .filter(|sym| sym.kind() == object::SymbolKind::Text)
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some((sym.address(), sym.size(), demangle(name)))
            })
            .collect();
        symbols.sort_by_key(|&(addr, _, _)| addr);
        symbols.dedup_by_key(|&mut (addr, _, _)| addr);

        if symbols.is_empty() {
            return Err(format!("{path} has no symbol table"));
        }

        Ok(SymtabResolver {
            name: path.to_owned(),
            symbols,
        })
    }
}

impl FunctionResolver for SymtabResolver {
    fn lookup_line_info(&self, offset: Address) -> Option<LineInfo> {
        let addr = offset.value();
        let idx = match self.symbols.binary_search_by_key(&addr, |&(a, _, _)| a) {
            Ok(idx) => idx,
            Err(0) => return Some(LineInfo::for_unknown_function_in(offset, &self.name)),
            Err(idx) => idx - 1,
        };
        let (start, size, ref name) = self.symbols[idx];
        if size > 0 && addr >= start + size {
            return Some(LineInfo::for_unknown_function_in(offset, &self.name));
        }
        Some(LineInfo::new(name, super::UNKNOWN, 0, &self.name))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Kernel symbols from `/proc/kallsyms`. Symbol addresses are stored
/// relative to the lowest one; the overlay installs the matching mapping
/// with `pgoff = 0` starting at that address.
pub struct KallsymsResolver {
    start: Address,
    // (offset from start, name), sorted.
    symbols: Vec<(u64, String)>,
}

impl KallsymsResolver {
    /// The shared instance; `/proc/kallsyms` does not change while we run.
    pub fn cached() -> Arc<KallsymsResolver> {
        static CACHE: OnceLock<Arc<KallsymsResolver>> = OnceLock::new();
        CACHE
            .get_or_init(|| Arc::new(Self::parse_file("/proc/kallsyms")))
            .clone()
    }

    fn parse_file(path: &str) -> KallsymsResolver {
        let content = fs::read_to_string(path).unwrap_or_default();
        Self::parse(&content)
    }

    fn parse(content: &str) -> KallsymsResolver {
        let mut raw: Vec<(u64, String)> = content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
                let kind = parts.next()?;
                let name = parts.next()?;
                // Only code symbols; a paranoid kernel reports all zeroes,
                // which are useless.
                if addr == 0 || !matches!(kind, "t" | "T") {
                    return None;
                }
                Some((addr, name.to_owned()))
            })
            .collect();
        raw.sort_by_key(|&(addr, _)| addr);

        let start = raw.first().map_or(Address(0), |&(addr, _)| Address(addr));
        let symbols = raw
            .into_iter()
            .map(|(addr, name)| (addr - start.value(), name))
            .collect();
        KallsymsResolver { start, symbols }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl FunctionResolver for KallsymsResolver {
    fn lookup_line_info(&self, offset: Address) -> Option<LineInfo> {
        let idx = match self
            .symbols
            .binary_search_by_key(&offset.value(), |&(a, _)| a)
        {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (_, ref name) = self.symbols[idx];
        Some(LineInfo::new(name, "[kernel.kallsyms]", 0, "[kernel]"))
    }

    fn name(&self) -> &str {
        "[kernel.kallsyms]"
    }
}

/// JIT symbols from `/tmp/perf-<pid>.map`: `STARTADDR SIZE name` per line,
/// addresses absolute. The overlay mapping spans `[min, max)` with
/// `pgoff = min`, so lookups see absolute addresses again.
pub struct PerfMapResolver {
    name: String,
    // (start, size, name), sorted by start.
    symbols: Vec<(u64, u64, String)>,
}

impl PerfMapResolver {
    pub fn open(process: Process) -> Option<PerfMapResolver> {
        let path = format!("/tmp/perf-{}.map", process.as_raw());
        let content = fs::read_to_string(&path).ok()?;
        let resolver = Self::parse(&path, &content);
        if resolver.symbols.is_empty() {
            return None;
        }
        Some(resolver)
    }

    fn parse(name: &str, content: &str) -> PerfMapResolver {
        let mut symbols: Vec<(u64, u64, String)> = content
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, ' ');
                let start = u64::from_str_radix(parts.next()?, 16).ok()?;
                let size = u64::from_str_radix(parts.next()?, 16).ok()?;
                let name = parts.next()?.trim();
                if name.is_empty() {
                    return None;
                }
                Some((start, size, name.to_owned()))
            })
            .collect();
        symbols.sort_by_key(|&(start, _, _)| start);
        PerfMapResolver {
            name: name.to_owned(),
            symbols,
        }
    }

    /// The address range covered by this map file.
    pub fn range(&self) -> Option<(Address, Address)> {
        let first = self.symbols.first()?;
        let last = self.symbols.last()?;
        Some((Address(first.0), Address(last.0 + last.1.max(1))))
    }
}

impl FunctionResolver for PerfMapResolver {
    fn lookup_line_info(&self, offset: Address) -> Option<LineInfo> {
        let addr = offset.value();
        let idx = match self.symbols.binary_search_by_key(&addr, |&(a, _, _)| a) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (start, size, ref name) = self.symbols[idx];
        if addr >= start + size.max(1) {
            return None;
        }
        Some(LineInfo::new(name, &self.name, 0, "[jit]"))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

static USE_DWARF: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Disables the DWARF backend; lookups fall through to the ELF symbol
/// table. Set once at startup from the configuration.
pub fn set_use_dwarf(enabled: bool) {
    USE_DWARF.store(enabled, std::sync::atomic::Ordering::SeqCst);
}

fn use_dwarf() -> bool {
    USE_DWARF.load(std::sync::atomic::Ordering::SeqCst)
}

/// Picks the best available backend for a file-backed mapping:
/// DWARF, then the ELF symbol table, then the stub. Results are shared
/// across processes by filename.
pub fn resolver_for_file(filename: &str) -> Arc<dyn FunctionResolver> {
    static CACHE: OnceLock<Mutex<FxHashMap<String, Arc<dyn FunctionResolver>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(FxHashMap::default()));
    let mut cache = cache.lock();

    if let Some(resolver) = cache.get(filename) {
        return resolver.clone();
    }

    let dwarf = if use_dwarf() {
        DwarfResolver::open(filename).map_err(|err| {
            log::debug!("no dwarf for {filename}: {err}");
        })
    } else {
        Err(())
    };
    let resolver: Arc<dyn FunctionResolver> = match dwarf {
        Ok(dwarf) => Arc::new(dwarf),
        Err(()) => match SymtabResolver::open(filename) {
            Ok(symtab) => Arc::new(symtab),
            Err(symtab_err) => {
                log::debug!("no symbol table for {filename}: {symtab_err}");
                Arc::new(StubResolver::new(filename))
            }
        },
    };

    cache.insert(filename.to_owned(), resolver.clone());
    resolver
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_echoes_its_name() {
        let stub = StubResolver::new("[vdso]");
        let info = stub.lookup_line_info(Address(0x123)).unwrap();
        assert_eq!(info.function, "[vdso]");
        assert_eq!(info.dso, "[vdso]");
    }

    #[test]
    fn kallsyms_parse_and_lookup() {
        let content = "\
ffffffff81000000 T _text
ffffffff81001000 T do_one_initcall
ffffffff81002000 t __init_begin
ffffffff81003000 D some_data
0000000000000000 T hidden_by_paranoia
";
        let kallsyms = KallsymsResolver::parse(content);
        assert_eq!(kallsyms.start(), Address(0xffffffff81000000));

        // Offsets are relative to the start.
        let info = kallsyms.lookup_line_info(Address(0x1234)).unwrap();
        assert_eq!(info.function, "do_one_initcall");
        let info = kallsyms.lookup_line_info(Address(0x0)).unwrap();
        assert_eq!(info.function, "_text");
        // Data symbols and all-zero entries are skipped.
        let info = kallsyms.lookup_line_info(Address(0x3500)).unwrap();
        assert_eq!(info.function, "__init_begin");
    }

    #[test]
    fn perf_map_parse_and_lookup() {
        let content = "\
7f0000001000 100 jitted_add
7f0000002000 200 jitted_mul
";
        let map = PerfMapResolver::parse("perf-1234.map", content);
        assert_eq!(
            map.range(),
            Some((Address(0x7f0000001000), Address(0x7f0000002200)))
        );
        let info = map.lookup_line_info(Address(0x7f0000001080)).unwrap();
        assert_eq!(info.function, "jitted_add");
        assert!(map.lookup_line_info(Address(0x7f0000001200)).is_none());
        let info = map.lookup_line_info(Address(0x7f00000020ff)).unwrap();
        assert_eq!(info.function, "jitted_mul");
    }

    #[test]
    fn demangles_rust_and_cpp() {
        assert_eq!(
            demangle("_ZN4core3fmt5write17h1234567890abcdefE"),
            "core::fmt::write"
        );
        assert_eq!(demangle("_Z3foov"), "foo()");
        assert_eq!(demangle("plain_c_symbol"), "plain_c_symbol");
    }
}
