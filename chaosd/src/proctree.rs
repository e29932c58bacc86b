use std::collections::{HashMap, HashSet, VecDeque};

use sysinfo::{ProcessesToUpdate, System};

/// One process of a container's process tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub comm: String,
}

pub trait ProcessInspector: Send + Sync {
    /// `root` followed by its descendants, breadth first.
    fn process_tree(&self, root: u32) -> Vec<ProcessEntry>;
}

/// Reads the host process table through `sysinfo`.
#[derive(Debug, Default)]
pub struct SysinfoInspector;

impl ProcessInspector for SysinfoInspector {
    fn process_tree(&self, root: u32) -> Vec<ProcessEntry> {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut names: HashMap<u32, String> = HashMap::new();
        for (pid, proc_) in sys.processes() {
            // Threads show up as tasks of their process; only real processes
            // can host the runtime we are looking for.
            if proc_.thread_kind().is_some() {
                continue;
            }
            names.insert(
                pid.as_u32(),
                proc_.name().to_str().unwrap_or("").to_string(),
            );
            if let Some(parent) = proc_.parent() {
                children.entry(parent.as_u32()).or_default().push(pid.as_u32());
            }
        }
        for list in children.values_mut() {
            list.sort_unstable();
        }

        walk(root, &children, &names)
    }
}

fn walk(
    root: u32,
    children: &HashMap<u32, Vec<u32>>,
    names: &HashMap<u32, String>,
) -> Vec<ProcessEntry> {
    let mut tree = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = VecDeque::from([root]);
    while let Some(pid) = pending.pop_front() {
        if !seen.insert(pid) {
            continue;
        }
        let Some(comm) = names.get(&pid) else {
            continue;
        };
        tree.push(ProcessEntry {
            pid,
            comm: comm.clone(),
        });
        if let Some(kids) = children.get(&pid) {
            pending.extend(kids.iter().copied());
        }
    }
    tree
}

/// First process in `tree` whose command name is `comm`.
pub fn find_by_comm(tree: &[ProcessEntry], comm: &str) -> Option<u32> {
    tree.iter()
        .find(|entry| entry.comm.trim_end() == comm)
        .map(|entry| entry.pid)
}
