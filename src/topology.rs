//! The CPU/core/package topology of the machine, read once from sysfs.

use std::fs;
use std::sync::OnceLock;

use crate::perf::pmu::parse_cpu_list;
use crate::types::{Core, Cpu, Package};

#[derive(Debug, Clone, Copy)]
struct CpuEntry {
    cpu: Cpu,
    core: Core,
    package: Package,
}

#[derive(Debug)]
pub struct Topology {
    entries: Vec<CpuEntry>,
}

impl Topology {
    pub fn instance() -> &'static Topology {
        static INSTANCE: OnceLock<Topology> = OnceLock::new();
        INSTANCE.get_or_init(Topology::read_sysfs)
    }

    fn read_sysfs() -> Topology {
        let online = fs::read_to_string("/sys/devices/system/cpu/online").unwrap_or_default();
        let cpus = parse_cpu_list(&online).unwrap_or_default();

        let entries = if cpus.is_empty() {
            // Paranoid fallback; a machine always has CPU 0.
            (0..num_cpus::get() as i32)
                .map(|id| (Cpu(id), id, 0))
                .map(|(cpu, core, package)| CpuEntry {
                    cpu,
                    core: Core::new(core, package),
                    package: Package(package),
                })
                .collect()
        } else {
            cpus.into_iter()
                .map(|cpu| {
                    let base = format!("/sys/devices/system/cpu/cpu{}/topology", cpu.as_raw());
                    let core_id = read_int(&format!("{base}/core_id")).unwrap_or(cpu.as_raw());
                    let package_id =
                        read_int(&format!("{base}/physical_package_id")).unwrap_or(0);
                    CpuEntry {
                        cpu,
                        core: Core::new(core_id, package_id),
                        package: Package(package_id),
                    }
                })
                .collect()
        };

        Topology { entries }
    }

    #[cfg(test)]
    fn from_entries(entries: Vec<(i32, i32, i32)>) -> Topology {
        Topology {
            entries: entries
                .into_iter()
                .map(|(cpu, core, package)| CpuEntry {
                    cpu: Cpu(cpu),
                    core: Core::new(core, package),
                    package: Package(package),
                })
                .collect(),
        }
    }

    pub fn cpus(&self) -> impl Iterator<Item = Cpu> + '_ {
        self.entries.iter().map(|e| e.cpu)
    }

    pub fn num_cpus(&self) -> usize {
        self.entries.len()
    }

    pub fn core_of(&self, cpu: Cpu) -> Core {
        self.entries
            .iter()
            .find(|e| e.cpu == cpu)
            .map(|e| e.core)
            .unwrap_or(Core::new(cpu.as_raw(), 0))
    }

    pub fn package_of(&self, cpu: Cpu) -> Package {
        self.entries
            .iter()
            .find(|e| e.cpu == cpu)
            .map(|e| e.package)
            .unwrap_or(Package(0))
    }
}

fn read_int(path: &str) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_cpus_to_cores_and_packages() {
        let topo = Topology::from_entries(vec![
            (0, 0, 0),
            (1, 1, 0),
            (2, 0, 1),
            (3, 1, 1),
        ]);
        assert_eq!(topo.num_cpus(), 4);
        assert_eq!(topo.core_of(Cpu(2)), Core::new(0, 1));
        assert_eq!(topo.package_of(Cpu(3)), Package(1));
        let cpus: Vec<Cpu> = topo.cpus().collect();
        assert_eq!(cpus, vec![Cpu(0), Cpu(1), Cpu(2), Cpu(3)]);
    }

    #[test]
    fn unknown_cpu_gets_a_sensible_default() {
        let topo = Topology::from_entries(vec![(0, 0, 0)]);
        assert_eq!(topo.core_of(Cpu(9)), Core::new(9, 0));
    }
}
