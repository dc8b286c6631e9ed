//! Observation of the process/thread topology: `/proc` scans and the ptrace
//! lifecycle tracker.

pub mod maps;
pub mod tracker;

use std::collections::BTreeMap;
use std::fs;

use crate::types::{Process, Thread};

/// The comm of one task, without the trailing newline.
pub fn get_task_comm(process: Process, thread: Thread) -> Option<String> {
    let path = format!(
        "/proc/{}/task/{}/comm",
        process.as_raw(),
        thread.as_raw()
    );
    let comm = fs::read_to_string(path).ok()?;
    Some(comm.trim_end_matches('\n').to_owned())
}

pub fn get_process_comm(process: Process) -> Option<String> {
    get_task_comm(process, process.as_thread())
}

/// All live processes with their threads and comms, from one `/proc` scan.
pub fn get_comms_for_running_threads() -> BTreeMap<Process, BTreeMap<Thread, String>> {
    let mut result = BTreeMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return result;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<libc::pid_t>().ok())
        else {
            continue;
        };
        let process = Process(pid);
        let mut threads = BTreeMap::new();
        for thread in get_threads(process) {
            let comm = get_task_comm(process, thread).unwrap_or_default();
            threads.insert(thread, comm);
        }
        if !threads.is_empty() {
            result.insert(process, threads);
        }
    }
    result
}

/// The thread ids of one process, including the main thread.
pub fn get_threads(process: Process) -> Vec<Thread> {
    let mut threads = Vec::new();
    let Ok(entries) = fs::read_dir(format!("/proc/{}/task", process.as_raw())) else {
        return threads;
    };
    for entry in entries.flatten() {
        if let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<libc::pid_t>().ok())
        {
            threads.push(Thread(tid));
        }
    }
    threads.sort();
    threads
}
