use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use super::definitions::*;
use super::writer::FileSink;
use super::ClockProperties;

/// Expands the `{DATE}`, `{HOSTNAME}` and `{ENV=NAME}` tokens of a configured
/// trace path. Unset environment variables expand to the empty string.
pub fn expand_trace_path(template: &str, now: DateTime<Local>) -> String {
    let mut path = template.replace("{DATE}", &now.format("%Y-%m-%dT%H-%M-%S").to_string());

    if path.contains("{HOSTNAME}") {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".into());
        path = path.replace("{HOSTNAME}", &hostname);
    }

    while let Some(start) = path.find("{ENV=") {
        let Some(rel_end) = path[start..].find('}') else {
            break;
        };
        let end = start + rel_end;
        let name = &path[start + 5..end];
        let value = std::env::var(name).unwrap_or_default();
        path.replace_range(start..=end, &value);
    }

    path
}

/// Replaces the path named by `LO2S_OUTPUT_LINK` with a symlink to the
/// completed trace directory. An existing non-symlink is left alone.
pub fn update_output_link(trace_path: &Path) {
    let Ok(link_path) = std::env::var("LO2S_OUTPUT_LINK") else {
        return;
    };
    if link_path.is_empty() {
        return;
    }
    let link_path = PathBuf::from(link_path);

    match fs::symlink_metadata(&link_path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if let Err(err) = fs::remove_file(&link_path) {
                log::warn!("could not remove old output link {}: {err}", link_path.display());
                return;
            }
        }
        Ok(_) => {
            log::warn!(
                "the path {} exists and isn't a symlink, refusing to create link to latest trace",
                link_path.display()
            );
            return;
        }
        Err(_) => {}
    }

    if let Err(err) = std::os::unix::fs::symlink(trace_path, &link_path) {
        log::warn!("could not create output link {}: {err}", link_path.display());
    }
}

/// The on-disk trace archive: a directory with an anchor file, the global
/// definitions, and one event stream file per location under `traces/`.
pub struct Archive {
    path: PathBuf,
    creator: String,
    description: String,
    properties: Vec<(String, String)>,
}

impl Archive {
    pub fn create(path: &Path) -> io::Result<Archive> {
        fs::create_dir_all(path.join("traces"))?;
        Ok(Archive {
            path: path.to_owned(),
            creator: String::new(),
            description: String::new(),
            properties: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_creator(&mut self, creator: String) {
        self.creator = creator;
    }

    pub fn set_description(&mut self, description: String) {
        self.description = description;
    }

    /// Trace-level property, mirrored from the system tree root properties so
    /// that analysis tools can get at it without walking the tree.
    pub fn set_property(&mut self, name: String, value: String) {
        self.properties.push((name, value));
    }

    pub fn event_sink(&self, location: LocationRef) -> io::Result<FileSink<File>> {
        let file = File::create(self.path.join("traces").join(format!("{}.evt", location.0)))?;
        Ok(FileSink::new(file))
    }

    /// Writes the anchor file and the serialized global definitions. Called
    /// exactly once, after all event streams are closed.
    pub fn finish(&self, defs: &Definitions, clock: &ClockProperties) -> io::Result<()> {
        let mut anchor = File::create(self.path.join("otter.otf2"))?;
        writeln!(anchor, "creator: {}", self.creator)?;
        writeln!(anchor, "description: {}", self.description)?;
        for (name, value) in &self.properties {
            writeln!(anchor, "property: {name} = {value}")?;
        }

        let mut out = io::BufWriter::new(File::create(self.path.join("definitions"))?);
        writeln!(
            out,
            "ClockProperties {} {} {}",
            clock.ticks_per_second,
            clock.global_offset.nanos(),
            clock.trace_length
        )?;
        for (i, s) in defs.strings.iter().enumerate() {
            writeln!(out, "String {i} {s:?}")?;
        }
        for (i, n) in defs.system_tree_nodes.iter().enumerate() {
            writeln!(
                out,
                "SystemTreeNode {i} name={} class={} parent={}",
                n.name.0,
                n.class_name.0,
                n.parent.map_or(-1, |p| p.0 as i64)
            )?;
        }
        for p in &defs.system_tree_node_properties {
            writeln!(
                out,
                "SystemTreeNodeProperty node={} name={} value={}",
                p.node.0, p.name.0, p.value.0
            )?;
        }
        for (i, g) in defs.location_groups.iter().enumerate() {
            writeln!(
                out,
                "LocationGroup {i} name={} parent={} type={:?}",
                g.name.0, g.parent.0, g.group_type
            )?;
        }
        for (i, l) in defs.locations.iter().enumerate() {
            writeln!(
                out,
                "Location {i} name={} group={} type={:?}",
                l.name.0, l.group.0, l.location_type
            )?;
        }
        for (i, r) in defs.regions.iter().enumerate() {
            writeln!(
                out,
                "Region {i} name={} file={} line={} paradigm={:?}",
                r.name.0, r.source_file.0, r.begin_line, r.paradigm
            )?;
        }
        for (i, s) in defs.source_code_locations.iter().enumerate() {
            writeln!(out, "SourceCodeLocation {i} file={} line={}", s.file.0, s.line)?;
        }
        for (i, c) in defs.calling_contexts.iter().enumerate() {
            writeln!(
                out,
                "CallingContext {i} region={} scl={} parent={}",
                c.region.0,
                c.source_code_location.map_or(-1, |s| s.0 as i64),
                c.parent.map_or(-1, |p| p.0 as i64)
            )?;
        }
        for p in &defs.calling_context_properties {
            writeln!(
                out,
                "CallingContextProperty cctx={} name={} value={}",
                p.calling_context.0, p.name.0, p.value.0
            )?;
        }
        for (i, g) in defs.comm_groups.iter().enumerate() {
            writeln!(out, "CommGroup {i} name={} paradigm={:?}", g.name.0, g.paradigm)?;
        }
        for (i, c) in defs.comms.iter().enumerate() {
            writeln!(out, "Comm {i} name={} group={}", c.name.0, c.group.0)?;
        }
        for (i, m) in defs.metric_members.iter().enumerate() {
            writeln!(
                out,
                "MetricMember {i} name={} unit={} mode={:?}",
                m.name.0, m.unit.0, m.mode
            )?;
        }
        for (i, c) in defs.metric_classes.iter().enumerate() {
            let members: Vec<String> = c.members.iter().map(|m| m.0.to_string()).collect();
            writeln!(out, "MetricClass {i} members={}", members.join(","))?;
        }
        for (i, m) in defs.metric_instances.iter().enumerate() {
            writeln!(
                out,
                "MetricInstance {i} class={} recorder={} scope={}",
                m.class.0, m.recorder.0, m.scope.0
            )?;
        }
        for (i, p) in defs.io_paradigms.iter().enumerate() {
            writeln!(
                out,
                "IoParadigm {i} identification={} name={}",
                p.identification.0, p.name.0
            )?;
        }
        for (i, f) in defs.io_regular_files.iter().enumerate() {
            writeln!(out, "IoRegularFile {i} name={} scope={}", f.name.0, f.scope.0)?;
        }
        for (i, h) in defs.io_handles.iter().enumerate() {
            writeln!(
                out,
                "IoHandle {i} name={} file={} paradigm={} comm={}",
                h.name.0,
                h.file.0,
                h.paradigm.0,
                h.comm.map_or(-1, |c| c.0 as i64)
            )?;
        }
        for s in &defs.io_pre_created_handle_states {
            writeln!(
                out,
                "IoPreCreatedHandleState handle={} mode={:?}",
                s.handle.0, s.access_mode
            )?;
        }
        for (i, g) in defs.interrupt_generators.iter().enumerate() {
            writeln!(
                out,
                "InterruptGenerator {i} name={} period={}",
                g.name.0, g.period
            )?;
        }
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expand_date_token() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 13, 5, 9).unwrap();
        let path = expand_trace_path("otter_trace_{DATE}", now);
        assert_eq!(path, "otter_trace_2024-03-07T13-05-09");
    }

    #[test]
    fn expand_env_token() {
        std::env::set_var("OTTER_TEST_TOKEN", "abc");
        let now = Local.with_ymd_and_hms(2024, 3, 7, 13, 5, 9).unwrap();
        assert_eq!(
            expand_trace_path("trace_{ENV=OTTER_TEST_TOKEN}", now),
            "trace_abc"
        );
        assert_eq!(
            expand_trace_path("trace_{ENV=OTTER_UNSET_TOKEN}", now),
            "trace_"
        );
    }

    #[test]
    fn hostname_token_is_nonempty() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 13, 5, 9).unwrap();
        let path = expand_trace_path("{HOSTNAME}", now);
        assert!(!path.is_empty());
        assert!(!path.contains("{HOSTNAME}"));
    }
}
