use std::collections::BTreeMap;
use std::sync::Arc;

use super::resolver::{FunctionResolver, InstructionResolver};
use super::{LineInfo, LookupError};
use crate::address::{Address, Mapping};

#[derive(Clone)]
pub struct MapEntry {
    pub mapping: Mapping,
    pub function_resolver: Arc<dyn FunctionResolver>,
    pub instruction_resolver: Arc<dyn InstructionResolver>,
}

/// An ordered map from disjoint address ranges to resolver pairs.
///
/// A new mapping may overlap existing ones in three ways: existing mappings
/// lie entirely inside it, it lies entirely inside an existing one, or it
/// partially overlaps existing mappings at either edge. All three are
/// resolved on insertion so the invariant "every address falls in at most
/// one range" holds at all times.
#[derive(Default, Clone)]
pub struct MemoryMap {
    entries: BTreeMap<Address, MapEntry>,
}

impl MemoryMap {
    pub fn new() -> MemoryMap {
        MemoryMap::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapEntry> {
        self.entries.values()
    }

    pub fn emplace(
        &mut self,
        new_mapping: Mapping,
        function_resolver: Arc<dyn FunctionResolver>,
        instruction_resolver: Arc<dyn InstructionResolver>,
    ) {
        let new_range = new_mapping.range;

        // Existing mappings entirely inside the new one are replaced by it.
        let contained: Vec<Address> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.mapping.range.is_inside(&new_range))
            .map(|(&start, _)| start)
            .collect();
        for start in contained {
            log::debug!("mapping at {start} superseded by {new_range}");
            self.entries.remove(&start);
        }

        // The new mapping may sit entirely inside an existing one; split
        // that one around it.
        if let Some(entry) = self
            .lookup_entry(new_range.start)
            .filter(|entry| new_range.is_inside(&entry.mapping.range))
            .cloned()
        {
            let existing = entry.mapping;
            log::debug!("{new_range} inside {}, splitting", existing.range);
            self.entries.remove(&existing.range.start);

            if existing.range.start < new_range.start {
                let left = Mapping {
                    range: crate::address::Range {
                        start: existing.range.start,
                        end: new_range.start,
                    },
                    pgoff: existing.pgoff,
                };
                self.insert_entry(left, entry.function_resolver.clone(), entry.instruction_resolver.clone());
            }
            if new_range.end < existing.range.end {
                let right = Mapping {
                    range: crate::address::Range {
                        start: new_range.end,
                        end: existing.range.end,
                    },
                    pgoff: existing.pgoff + (new_range.end - existing.range.start),
                };
                self.insert_entry(right, entry.function_resolver, entry.instruction_resolver);
            }

            self.insert_entry(new_mapping, function_resolver, instruction_resolver);
            return;
        }

        // Partial overlap on the left: an existing mapping reaches into the
        // new one from below. Truncate its end.
        if let Some(entry) = self.lookup_entry(new_range.start).cloned() {
            let mut existing = entry.mapping;
            self.entries.remove(&existing.range.start);
            log::debug!(
                "truncating mapping end from {} to {}",
                existing.range.end,
                new_range.start
            );
            existing.range.end = new_range.start;
            self.insert_entry(existing, entry.function_resolver, entry.instruction_resolver);
        }

        // Partial overlap on the right: an existing mapping starts inside
        // the new one and reaches beyond it. Advance its start.
        let right_start = self
            .entries
            .range(new_range.start..new_range.end)
            .next()
            .map(|(&start, _)| start);
        if let Some(start) = right_start {
            let entry = self.entries.remove(&start).unwrap();
            let mut existing = entry.mapping;
            log::debug!(
                "moving mapping start from {} to {}",
                existing.range.start,
                new_range.end
            );
            existing.pgoff = existing.pgoff + (new_range.end - existing.range.start);
            existing.range.start = new_range.end;
            self.insert_entry(existing, entry.function_resolver, entry.instruction_resolver);
        }

        self.insert_entry(new_mapping, function_resolver, instruction_resolver);
    }

    fn insert_entry(
        &mut self,
        mapping: Mapping,
        function_resolver: Arc<dyn FunctionResolver>,
        instruction_resolver: Arc<dyn InstructionResolver>,
    ) {
        let overlapping = self
            .lookup_entry(mapping.range.start)
            .map(|e| e.mapping.range);
        if let Some(range) = overlapping {
            // The insertion algorithm above should have cleared the way;
            // anything left here is a bug.
            debug_assert!(false, "range {} still overlaps {range}", mapping.range);
            log::error!(
                "overlapping ranges {} and {range} after overlap resolution, dropping insert",
                mapping.range
            );
            return;
        }
        self.entries.insert(mapping.range.start, MapEntry {
            mapping,
            function_resolver,
            instruction_resolver,
        });
    }

    fn lookup_entry(&self, addr: Address) -> Option<&MapEntry> {
        let (_, entry) = self.entries.range(..=addr).next_back()?;
        if entry.mapping.range.contains(addr) {
            Some(entry)
        } else {
            None
        }
    }

    pub fn lookup(&self, addr: Address) -> Option<&MapEntry> {
        self.lookup_entry(addr)
    }

    pub fn lookup_line_info(&self, ip: Address) -> LineInfo {
        match self.lookup_entry(ip) {
            Some(entry) => {
                let offset = entry.mapping.file_offset(ip);
                entry
                    .function_resolver
                    .lookup_line_info(offset)
                    .unwrap_or_else(|| {
                        LineInfo::for_unknown_function_in(ip, entry.function_resolver.name())
                    })
            }
            None => {
                log::debug!("no mapping found for address {ip}");
                // Coarsen to keep the number of distinct fallback regions
                // bounded.
                LineInfo::for_address(ip.truncate_bits(48))
            }
        }
    }

    pub fn lookup_instruction(&self, ip: Address) -> Result<String, LookupError> {
        let entry = self.lookup_entry(ip).ok_or(LookupError(ip))?;
        entry
            .instruction_resolver
            .lookup_instruction(entry.mapping.file_offset(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::resolver::{StubResolver, UnknownInstructionResolver};

    fn emplace(map: &mut MemoryMap, start: u64, end: u64, pgoff: u64, name: &str) {
        map.emplace(
            Mapping::new(Address(start), Address(end), Address(pgoff)).unwrap(),
            Arc::new(StubResolver::new(name)),
            Arc::new(UnknownInstructionResolver),
        );
    }

    fn ranges(map: &MemoryMap) -> Vec<(u64, u64, u64, String)> {
        map.iter()
            .map(|e| {
                (
                    e.mapping.range.start.value(),
                    e.mapping.range.end.value(),
                    e.mapping.pgoff.value(),
                    e.function_resolver.name().to_owned(),
                )
            })
            .collect()
    }

    fn assert_disjoint(map: &MemoryMap) {
        let rs = ranges(map);
        for pair in rs.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{pair:?} overlap");
        }
    }

    #[test]
    fn disjoint_mappings_coexist() {
        let mut map = MemoryMap::new();
        emplace(&mut map, 0x1000, 0x2000, 0, "a");
        emplace(&mut map, 0x4000, 0x5000, 0, "b");
        assert_eq!(map.len(), 2);
        assert_disjoint(&map);
    }

    #[test]
    fn contained_mapping_splits_the_outer_one() {
        let mut map = MemoryMap::new();
        emplace(&mut map, 0x1000, 0x3000, 0x0, "a");
        emplace(&mut map, 0x2000, 0x2800, 0x100, "b");

        assert_eq!(
            ranges(&map),
            vec![
                (0x1000, 0x2000, 0x0, "a".to_owned()),
                (0x2000, 0x2800, 0x100, "b".to_owned()),
                (0x2800, 0x3000, 0x1800, "a".to_owned()),
            ]
        );
        assert_disjoint(&map);
    }

    #[test]
    fn outer_mapping_deletes_contained_ones() {
        let mut map = MemoryMap::new();
        emplace(&mut map, 0x2000, 0x2800, 0, "inner1");
        emplace(&mut map, 0x2900, 0x2a00, 0, "inner2");
        emplace(&mut map, 0x1000, 0x3000, 0, "outer");

        assert_eq!(ranges(&map), vec![(0x1000, 0x3000, 0, "outer".to_owned())]);
    }

    #[test]
    fn left_partial_overlap_truncates_existing_end() {
        let mut map = MemoryMap::new();
        emplace(&mut map, 0x1000, 0x2800, 0, "a");
        emplace(&mut map, 0x2000, 0x3000, 0, "b");

        assert_eq!(
            ranges(&map),
            vec![
                (0x1000, 0x2000, 0, "a".to_owned()),
                (0x2000, 0x3000, 0, "b".to_owned()),
            ]
        );
        assert_disjoint(&map);
    }

    #[test]
    fn right_partial_overlap_advances_existing_start() {
        let mut map = MemoryMap::new();
        emplace(&mut map, 0x2000, 0x4000, 0x500, "a");
        emplace(&mut map, 0x1000, 0x3000, 0, "b");

        assert_eq!(
            ranges(&map),
            vec![
                (0x1000, 0x3000, 0x0, "b".to_owned()),
                (0x3000, 0x4000, 0x1500, "a".to_owned()),
            ]
        );
        assert_disjoint(&map);
    }

    #[test]
    fn identical_reinsert_replaces() {
        let mut map = MemoryMap::new();
        emplace(&mut map, 0x1000, 0x2000, 0, "a");
        emplace(&mut map, 0x1000, 0x2000, 0, "b");
        assert_eq!(ranges(&map), vec![(0x1000, 0x2000, 0, "b".to_owned())]);
    }

    #[test]
    fn random_insertions_stay_disjoint() {
        let mut map = MemoryMap::new();
        // A fixed pseudo-random-ish sequence of overlapping inserts.
        let inserts = [
            (0x1000u64, 0x9000u64),
            (0x2000, 0x3000),
            (0x2800, 0x4000),
            (0x0800, 0x1800),
            (0x5000, 0x6000),
            (0x0100, 0xa000),
            (0x4000, 0x4800),
        ];
        for (i, &(start, end)) in inserts.iter().enumerate() {
            emplace(&mut map, start, end, 0, &format!("m{i}"));
            assert_disjoint(&map);
        }
    }

    #[test]
    fn lookups_translate_through_pgoff() {
        let mut map = MemoryMap::new();
        emplace(&mut map, 0x1000, 0x2000, 0x0, "a");
        let info = map.lookup_line_info(Address(0x1234));
        assert_eq!(info.function, "a");

        let info = map.lookup_line_info(Address(0xffff_5555_0000_4321));
        assert_eq!(info.function, "?@0xffff000000000000");
    }
}
