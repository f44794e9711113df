//! Merges execution records into an access set and computes the closure of
//! paths the debloated image must carry.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use color_eyre::{eyre::OptionExt, Result};
use crate::{
    ext::{normalize, strip_root},
    oracle::Oracle,
    syscall::SockAddr,
    trace::ExecutionRecord,
};

/// Dynamic linkers the kernel reads implicitly at process start; they never
/// appear in the trace. The musl linker covers alpine-based images.
pub const DYNAMIC_LINKERS: [&str; 3] = [
    "/lib/ld-linux.so.2",
    "/lib64/ld-linux-x86-64.so.2",
    "/lib/ld-musl-x86_64.so.1",
];

/// Roots whose contents are synthesized at runtime and never belong in an
/// image.
const DYNAMIC_ROOTS: [&str; 3] = ["/dev", "/proc", "/sys"];

/// The union over exec generations of everything the image must provide.
///
/// Paths are absolute within the container; conversion to export-relative
/// paths happens when the closure is computed.
#[derive(Debug, Clone)]
pub struct AccessSet {
    /// Executable of the first merged generation; identifies the workload.
    pub exe: PathBuf,

    /// Executables counted as this workload's own.
    pub exes: BTreeSet<PathBuf>,

    /// Environment variable names any generation was started with.
    pub env_keys: BTreeSet<String>,

    /// Paths observed to exist.
    pub exists_files: BTreeSet<PathBuf>,

    /// Paths created, truncated, or modified.
    pub written_files: BTreeSet<PathBuf>,

    /// Outbound socket endpoints across all generations.
    pub connects: Vec<SockAddr>,

    /// Listening socket endpoints across all generations.
    pub binds: Vec<SockAddr>,

    /// Paths handed to `execve` that are not counted as own executables.
    pub exec_files: BTreeSet<PathBuf>,

    /// Whether this access set describes the workload's main image.
    pub is_main: bool,
}

impl AccessSet {
    /// Build from the record of a generation that actually ran.
    pub fn new(oracle: &Oracle, record: &ExecutionRecord, is_main: bool) -> Result<Self> {
        let exe = record
            .exe
            .clone()
            .ok_or_eyre("execution record has no executable")?;
        let mut access = Self {
            exe: exe.clone(),
            exes: BTreeSet::from([exe]),
            env_keys: BTreeSet::new(),
            exists_files: DYNAMIC_LINKERS.iter().map(PathBuf::from).collect(),
            written_files: BTreeSet::new(),
            connects: Vec::new(),
            binds: Vec::new(),
            exec_files: BTreeSet::new(),
            is_main,
        };
        access.absorb(oracle, record);
        Ok(access)
    }

    /// Union another generation into this set.
    pub fn merge(&mut self, oracle: &Oracle, record: &ExecutionRecord) {
        self.absorb(oracle, record);
    }

    fn absorb(&mut self, oracle: &Oracle, record: &ExecutionRecord) {
        self.env_keys.extend(record.envp.iter().map(|kv| env_key(kv)));
        self.exists_files.extend(record.exists_files.iter().cloned());
        self.written_files.extend(record.written_files.iter().cloned());
        if let Some(exe) = &record.exe {
            if let Some(interpreter) = oracle.read_interpreter(exe) {
                self.exists_files.insert(interpreter);
            }
        }
        self.connects.extend(record.connects.iter().cloned());
        self.binds.extend(record.binds.iter().cloned());
        if let Some(exec_file) = &record.exec_file {
            self.exec_files.insert(exec_file.clone());
        }
    }

    /// Merge every generation of every process into one access set.
    ///
    /// The state captured before a process's first `execve` has no executable
    /// and is dropped; the first real generation identifies the workload.
    pub fn merge_all<'a>(
        oracle: &Oracle,
        records: impl IntoIterator<Item = &'a ExecutionRecord>,
    ) -> Result<Self> {
        let mut live = records.into_iter().filter(|record| record.exe.is_some());
        let first = live
            .next()
            .ok_or_eyre("trace contains no exec generation")?;
        let mut access = Self::new(oracle, first, true)?;
        for record in live {
            access.merge(oracle, record);
        }
        Ok(access.normalized())
    }

    /// Normalize all paths, prune dynamic roots, and drop own executables
    /// from the exec-file set.
    pub fn normalized(mut self) -> Self {
        self.exes = self.exes.iter().map(normalize).collect();
        self.exists_files = self
            .exists_files
            .iter()
            .map(normalize)
            .filter(|path| !under_dynamic_root(path))
            .collect();
        self.written_files = self
            .written_files
            .iter()
            .map(normalize)
            .filter(|path| !under_dynamic_root(path))
            .collect();
        self.exec_files = self
            .exec_files
            .iter()
            .map(normalize)
            .filter(|path| !self.exes.contains(path))
            .collect();
        self
    }

    /// All paths the image must provide: everything observed existing plus
    /// everything written.
    pub fn touched(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.exists_files
            .iter()
            .chain(self.written_files.iter())
            .cloned()
    }
}

fn env_key(kv: &str) -> String {
    kv.split_once('=').map(|(key, _)| key).unwrap_or(kv).to_string()
}

fn under_dynamic_root(path: &Path) -> bool {
    DYNAMIC_ROOTS.iter().any(|root| path.starts_with(root))
}

/// Reduce absolute access paths to the subset present in the export.
///
/// Each path contributes its deepest existing prefix. When the lookup walked
/// through a symlink, the original path is kept as well, so [`closure`] can
/// graft the missing tail onto the link's resolved target.
pub fn existing_subset(
    oracle: &Oracle,
    paths: impl IntoIterator<Item = PathBuf>,
) -> BTreeSet<PathBuf> {
    let mut subset = BTreeSet::new();
    for path in paths {
        let original = strip_root(&path);
        let mut current = original.clone();
        let mut saw_link = false;
        while !current.as_os_str().is_empty() {
            if oracle.is_link(&current) {
                saw_link = true;
            }
            if oracle.lexists(&current) {
                subset.insert(current);
                if saw_link {
                    subset.insert(original);
                }
                break;
            }
            current = current.parent().map(Path::to_path_buf).unwrap_or_default();
        }
    }
    subset
}

/// Compute the full member list for the layer tar: every input path, every
/// ancestor directory, every symlink target reached transitively, and, for a
/// path routed through a symlinked ancestor, the same tail grafted onto the
/// link's resolved target so both names stay valid after extraction.
///
/// Input paths are export-relative (or absolute, in which case the root is
/// stripped). The returned list is deduplicated and sorted, which puts every
/// parent directory before its children.
pub fn closure(oracle: &Oracle, paths: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    let mut queue: Vec<PathBuf> = Vec::new();
    let mut queued: BTreeSet<PathBuf> = BTreeSet::new();
    for path in paths {
        let path = strip_root(&path);
        if queued.insert(path.clone()) {
            queue.push(path);
        }
    }

    let mut members = BTreeSet::new();
    let mut index = 0;
    while index < queue.len() {
        let original = queue[index].clone();
        index += 1;

        let mut ancestors: Vec<PathBuf> = Vec::new();
        let mut current = original.clone();
        while !current.as_os_str().is_empty() {
            ancestors.push(current.clone());
            let parent = current.parent().map(Path::to_path_buf).unwrap_or_default();

            if oracle.is_link(&current) {
                // Descendants of a link are reachable through its target;
                // only the link itself stays on this branch.
                ancestors = vec![current.clone()];
                if let Some(target) = oracle.read_link(&current) {
                    let target = if target.is_absolute() {
                        strip_root(&target)
                    } else {
                        normalize(parent.join(&target))
                    };
                    if oracle.lexists(&target) {
                        if queued.insert(target.clone()) {
                            queue.push(target.clone());
                        }
                        if current != original {
                            if let Ok(tail) = original.strip_prefix(&current) {
                                let grafted = normalize(target.join(tail));
                                if queued.insert(grafted.clone()) {
                                    queue.push(grafted);
                                }
                            }
                        }
                    }
                }
            }

            current = parent;
        }
        members.extend(ancestors);
    }

    members.into_iter().collect()
}
