//! Reconstructs per-process filesystem and socket access from a trace log.
//!
//! Each traced process owns a mutable [`ProcessState`]. A successful `execve`
//! freezes the state into an immutable [`ExecutionRecord`] and resets the
//! mutable fields (preserving the working directory), so one record describes
//! exactly one exec generation. The remaining state is frozen once more at
//! end of trace.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io::BufRead,
    path::{Path, PathBuf},
};

use color_eyre::{
    eyre::{bail, eyre, Context},
    Result,
};
use itertools::Itertools;
use tracing::{debug, warn};

use crate::{
    ext::normalize,
    syscall::{self, FdArg, SockAddr, SyscallLine, TraceEvent},
};

/// Flags under which `open` observes or creates content worth keeping in the
/// written set.
const WRITE_FLAGS: [&str; 3] = ["O_CREAT", "O_WRONLY", "O_RDWR"];

/// `creat(2)` is `open` with these flags implied.
const CREAT_FLAGS: [&str; 3] = ["O_CREAT", "O_WRONLY", "O_TRUNC"];

/// Syscalls the parser deliberately does not model. They are surfaced on the
/// finalized record rather than silently dropped.
const UNHANDLED: [&str; 19] = [
    "uselib",
    "acct",
    "mount",
    "umount2",
    "swapon",
    "swapoff",
    "quotactl",
    "setxattr",
    "lsetxattr",
    "getxattr",
    "lgetxattr",
    "listxattr",
    "llistxattr",
    "removexattr",
    "lremovexattr",
    "fanotify_mark",
    "name_to_handle_at",
    "renameat2",
    "chroot",
];

/// How many backslash insertions the execve payload recovery will attempt
/// before declaring the line unrecoverable.
const MAX_ESCAPE_REPAIRS: usize = 64;

/// A child process observed through a `clone`-family return or a `SIGCHLD`
/// sender pid, paired with the parent's working directory at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    pub pid: i64,
    pub cwd: PathBuf,
}

/// A syscall the parser does not model, with the trace line it appeared on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unhandled {
    pub name: String,
    pub lineno: usize,
}

/// An immutable snapshot of one exec generation's observed state.
///
/// Paths are absolute within the container and lexically normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Executable this generation was running. The state captured before the
    /// first `execve` of a process has none.
    pub exe: Option<PathBuf>,

    /// Arguments passed to the executable.
    pub argv: Vec<String>,

    /// Environment (`KEY=value` strings) passed to the executable.
    pub envp: Vec<String>,

    /// Working directory when the generation ended.
    pub cwd: PathBuf,

    /// Paths the process observed as existing: opened or statted files,
    /// directories, readlink sources, and informative failures.
    pub exists_files: BTreeSet<PathBuf>,

    /// Paths the process created, truncated, or modified.
    pub written_files: BTreeSet<PathBuf>,

    /// Outbound socket endpoints.
    pub connects: Vec<SockAddr>,

    /// Listening socket endpoints.
    pub binds: Vec<SockAddr>,

    /// Path handed to the `execve` that ended this generation, if one did.
    pub exec_file: Option<PathBuf>,

    /// Child processes spawned during this generation.
    pub children: Vec<Child>,

    /// Syscalls used by this generation that the parser does not model,
    /// with the trace lines they appeared on.
    pub unhandled: Vec<Unhandled>,
}

/// Parser phase for a single process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Container init before its `pivot_root`: everything it touches lives in
    /// the host rootfs and is irrelevant to the image.
    PrePivot,

    /// Pivot seen; waiting for the exec that enters the container image.
    PivotExec,

    /// Normal operation.
    Live,
}

/// Mutable per-process parsing state.
#[derive(Debug)]
pub struct ProcessState {
    mode: Mode,
    cwd: PathBuf,
    exe: Option<PathBuf>,
    argv: Vec<String>,
    envp: Vec<String>,
    exists_files: BTreeSet<PathBuf>,
    written_files: BTreeSet<PathBuf>,
    connects: Vec<SockAddr>,
    binds: Vec<SockAddr>,
    exec_file: Option<PathBuf>,
    children: Vec<Child>,
    unhandled: Vec<Unhandled>,

    /// Descriptor table for `dup`-class calls; most descriptor paths come
    /// from the tracer's inline annotations instead.
    fd_paths: HashMap<i64, PathBuf>,

    records: Vec<ExecutionRecord>,
}

impl ProcessState {
    fn new(cwd: PathBuf, container_root: bool) -> Self {
        Self {
            mode: if container_root {
                Mode::PrePivot
            } else {
                Mode::Live
            },
            exists_files: BTreeSet::from([cwd.clone()]),
            cwd,
            exe: None,
            argv: Vec::new(),
            envp: Vec::new(),
            written_files: BTreeSet::new(),
            connects: Vec::new(),
            binds: Vec::new(),
            exec_file: None,
            children: Vec::new(),
            unhandled: Vec::new(),
            fd_paths: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// Freeze the current generation into a record without disturbing it.
    fn snapshot(&self) -> ExecutionRecord {
        ExecutionRecord {
            exe: self.exe.as_deref().map(normalize),
            argv: self.argv.clone(),
            envp: self.envp.clone(),
            cwd: normalize(&self.cwd),
            exists_files: self.exists_files.iter().map(normalize).collect(),
            written_files: self.written_files.iter().map(normalize).collect(),
            connects: self.connects.clone(),
            binds: self.binds.clone(),
            exec_file: self.exec_file.as_deref().map(normalize),
            children: self.children.clone(),
            unhandled: self
                .unhandled
                .iter()
                .unique_by(|unhandled| unhandled.name.clone())
                .cloned()
                .collect(),
        }
    }

    fn handle(&mut self, event: &TraceEvent, lineno: usize) -> Result<()> {
        match event {
            TraceEvent::Skip => Ok(()),
            TraceEvent::Signal(signal) => {
                if signal.signal == "SIGCHLD" {
                    if let Some(pid) = signal.sender {
                        self.children.push(Child {
                            pid,
                            cwd: self.cwd.clone(),
                        });
                    }
                }
                Ok(())
            }
            TraceEvent::Syscall(call) => self.dispatch(call, lineno),
        }
    }

    fn dispatch(&mut self, call: &SyscallLine, lineno: usize) -> Result<()> {
        match self.mode {
            Mode::PrePivot => {
                if call.name == "pivot_root" {
                    // The initial pivot establishes the image root; descriptor
                    // annotations recorded before it point into the host rootfs.
                    self.fd_paths.clear();
                    self.mode = Mode::PivotExec;
                }
                Ok(())
            }
            Mode::PivotExec => {
                if call.name == "execve" && call.ok() {
                    self.sys_execve(call)?;
                    // The record for the pre-pivot state describes host-side
                    // accesses only; discard it.
                    self.records.pop();
                    self.mode = Mode::Live;
                }
                Ok(())
            }
            Mode::Live => self.dispatch_live(call, lineno),
        }
    }

    fn dispatch_live(&mut self, call: &SyscallLine, lineno: usize) -> Result<()> {
        let args = call.args.as_str();
        match call.name.as_str() {
            "open" => self.sys_open(&self.cwd.clone(), args, call, None)?,
            "creat" => self.sys_open(&self.cwd.clone(), args, call, Some(&CREAT_FLAGS))?,
            "openat" => {
                let (dir, rest) = self.at_dir(args)?;
                self.sys_open(&dir, rest, call, None)?;
            }

            "stat" | "lstat" | "access" | "truncate" | "unlink" | "readlink" => {
                self.sys_exists(&self.cwd.clone(), args, call)?;
            }
            "newfstatat" | "unlinkat" | "readlinkat" | "faccessat" => {
                let (dir, rest) = self.at_dir(args)?;
                self.sys_exists(&dir, rest, call)?;
            }

            "rename" | "link" => self.sys_rename(args, call)?,
            "renameat" | "linkat" => self.sys_renameat(args, call)?,
            "symlink" => self.sys_symlink(&self.cwd.clone(), args, call)?,
            "symlinkat" => self.sys_symlinkat(args, call)?,

            "mkdir" | "mknod" => self.sys_mkdir(&self.cwd.clone(), args, call)?,
            "mkdirat" | "mknodat" => {
                let (dir, rest) = self.at_dir(args)?;
                self.sys_mkdir(&dir, rest, call)?;
            }
            "rmdir" => self.sys_rmdir(args, call)?,

            "chmod" | "chown" | "lchown" | "utime" | "utimes" => {
                self.sys_touch(&self.cwd.clone(), args, call)?;
            }
            "fchmodat" | "fchownat" | "futimesat" | "utimensat" => {
                let (dir, rest) = self.at_dir(args)?;
                self.sys_touch(&dir, rest, call)?;
            }

            "chdir" => self.sys_chdir(args, call)?,
            "fchdir" => self.sys_fchdir(args, call)?,

            "execve" => self.sys_execve(call)?,
            "clone" | "fork" | "vfork" => self.sys_clone(call),

            "connect" => self.sys_connect(args, call)?,
            "bind" => self.sys_bind(args, call)?,

            "dup" | "dup2" | "dup3" => self.sys_dup(args, call)?,

            // Descriptor- and socket-level traffic carries no new paths.
            "statfs" | "sendfile" | "socket" | "accept" | "accept4" | "sendto" | "recvfrom"
            | "sendmsg" | "recvmsg" | "recvmmsg" | "sendmmsg" | "shutdown" | "listen"
            | "getsockname" | "getpeername" | "socketpair" | "setsockopt" | "getsockopt" => {}

            name if UNHANDLED.contains(&name) => {
                warn!(%lineno, syscall = name, "unhandled syscall");
                self.unhandled.push(Unhandled {
                    name: name.to_string(),
                    lineno,
                });
            }

            name => debug!(%lineno, syscall = name, "ignoring syscall"),
        }
        Ok(())
    }

    /// Resolve the directory an `*at` call is relative to, either the current
    /// working directory (`AT_FDCWD`) or the path annotated on the
    /// descriptor, and position past the descriptor argument.
    fn at_dir<'a>(&self, args: &'a str) -> Result<(PathBuf, &'a str)> {
        let (fd, rest) = syscall::fd_arg(args).context("scan directory descriptor")?;
        Ok((self.at_base(&fd), syscall::next_arg(rest)))
    }

    fn at_base(&self, fd: &FdArg) -> PathBuf {
        match fd {
            FdArg::Cwd => self.cwd.clone(),
            FdArg::Fd {
                path: Some(path), ..
            } => path.clone(),
            FdArg::Fd { fd, path: None } => {
                self.fd_paths.get(fd).cloned().unwrap_or_else(|| {
                    debug!(%fd, "descriptor without path annotation; assuming cwd");
                    self.cwd.clone()
                })
            }
        }
    }

    fn sys_open(
        &mut self,
        dir: &Path,
        args: &str,
        call: &SyscallLine,
        implied_flags: Option<&[&str]>,
    ) -> Result<()> {
        let (path, _, rest) = syscall::string_arg(args)?;
        let Some(path) = path else { return Ok(()) };
        let flags = match implied_flags {
            Some(flags) => flags.to_vec(),
            None => syscall::flags_arg(syscall::next_arg(rest)).0,
        };

        if call.ok() {
            let full = dir.join(&path);
            self.exists_files.insert(full.clone());
            // With O_CREAT only the parent directory had to exist beforehand.
            if flags.contains(&"O_CREAT") {
                self.exists_files.insert(dir.join(dirname(&path)));
            }
            if let Some(fd) = call.ret {
                self.fd_paths.insert(fd, full.clone());
            }
            if flags.iter().any(|flag| WRITE_FLAGS.contains(flag)) {
                self.written_files.insert(full);
            }
        }
        Ok(())
    }

    /// Calls whose success tells us the named path exists.
    fn sys_exists(&mut self, dir: &Path, args: &str, call: &SyscallLine) -> Result<()> {
        if call.ok() {
            let (path, _, _) = syscall::string_arg(args)?;
            if let Some(path) = path {
                self.exists_files.insert(dir.join(path));
            }
        }
        Ok(())
    }

    /// Metadata mutations: the path both exists and counts as written.
    fn sys_touch(&mut self, dir: &Path, args: &str, call: &SyscallLine) -> Result<()> {
        let (path, _, _) = syscall::string_arg(args)?;
        if call.ok() {
            // utimensat is traced with NULL paths at times.
            if let Some(path) = path {
                let full = dir.join(path);
                self.exists_files.insert(full.clone());
                self.written_files.insert(full);
            }
        }
        Ok(())
    }

    fn sys_mkdir(&mut self, dir: &Path, args: &str, call: &SyscallLine) -> Result<()> {
        let (path, _, _) = syscall::string_arg(args)?;
        let Some(path) = path else { return Ok(()) };
        if call.ok() {
            self.exists_files.insert(dir.join(dirname(&path)));
            self.written_files.insert(dir.join(&path));
        } else if call.failed_with("EEXIST") {
            self.exists_files.insert(dir.join(&path));
        }
        Ok(())
    }

    fn sys_rmdir(&mut self, args: &str, call: &SyscallLine) -> Result<()> {
        let (path, _, _) = syscall::string_arg(args)?;
        let Some(path) = path else { return Ok(()) };
        if call.ok() || call.failed_with("EBUSY") || call.failed_with("ENOTEMPTY") {
            self.exists_files.insert(self.cwd.join(path));
        }
        Ok(())
    }

    fn sys_rename(&mut self, args: &str, call: &SyscallLine) -> Result<()> {
        if !call.ok() {
            return Ok(());
        }
        let (source, _, rest) = syscall::string_arg(args)?;
        let (target, _, _) = syscall::string_arg(syscall::next_arg(rest))?;
        let (Some(source), Some(target)) = (source, target) else {
            return Ok(());
        };
        self.exists_files.insert(self.cwd.join(source));
        self.exists_files.insert(self.cwd.join(dirname(&target)));
        self.written_files.insert(self.cwd.join(target));
        Ok(())
    }

    fn sys_renameat(&mut self, args: &str, call: &SyscallLine) -> Result<()> {
        if !call.ok() {
            return Ok(());
        }
        let (source_fd, rest) = syscall::fd_arg(args)?;
        let (source, _, rest) = syscall::string_arg(syscall::next_arg(rest))?;
        let (target_fd, rest) = syscall::fd_arg(syscall::next_arg(rest))?;
        let (target, _, _) = syscall::string_arg(syscall::next_arg(rest))?;
        let (Some(source), Some(target)) = (source, target) else {
            return Ok(());
        };
        let source_dir = self.at_base(&source_fd);
        let target_dir = self.at_base(&target_fd);
        self.exists_files.insert(source_dir.join(source));
        self.exists_files.insert(target_dir.join(dirname(&target)));
        self.written_files.insert(target_dir.join(target));
        Ok(())
    }

    fn sys_symlink(&mut self, dir: &Path, args: &str, call: &SyscallLine) -> Result<()> {
        let (source, _, rest) = syscall::string_arg(args)?;
        let (target, _, _) = syscall::string_arg(syscall::next_arg(rest))?;
        let (Some(source), Some(target)) = (source, target) else {
            return Ok(());
        };
        if call.ok() {
            self.exists_files.insert(dir.join(source));
            self.exists_files.insert(dir.join(dirname(&target)));
            self.written_files.insert(dir.join(target));
        } else if call.failed_with("EEXIST") {
            self.exists_files.insert(dir.join(target));
        }
        Ok(())
    }

    fn sys_symlinkat(&mut self, args: &str, call: &SyscallLine) -> Result<()> {
        let (source, _, rest) = syscall::string_arg(args)?;
        let (fd, rest) = syscall::fd_arg(syscall::next_arg(rest))?;
        let (target, _, _) = syscall::string_arg(syscall::next_arg(rest))?;
        let (Some(source), Some(target)) = (source, target) else {
            return Ok(());
        };
        let dir = self.at_base(&fd);
        if call.ok() {
            self.exists_files.insert(dir.join(source));
            self.exists_files.insert(dir.join(dirname(&target)));
            self.written_files.insert(dir.join(target));
        } else if call.failed_with("EEXIST") {
            self.exists_files.insert(dir.join(target));
        }
        Ok(())
    }

    fn sys_chdir(&mut self, args: &str, call: &SyscallLine) -> Result<()> {
        if call.ok() {
            let (path, _, _) = syscall::string_arg(args)?;
            if let Some(path) = path {
                self.cwd = self.cwd.join(path);
            }
        }
        Ok(())
    }

    fn sys_fchdir(&mut self, args: &str, call: &SyscallLine) -> Result<()> {
        if call.ok() {
            let (fd, _) = syscall::fd_arg(args)?;
            self.cwd = self.at_base(&fd);
        }
        Ok(())
    }

    fn sys_execve(&mut self, call: &SyscallLine) -> Result<()> {
        if !call.ok() {
            return Ok(());
        }
        let (exe, argv, envp) = decode_execve(&call.args).context("decode execve arguments")?;
        let exe = PathBuf::from(exe);

        // The record being frozen is the generation that issued the exec;
        // it remembers which file it handed off to.
        self.exec_file = Some(exe.clone());
        let record = self.snapshot();
        self.records.push(record);

        self.exe = Some(exe.clone());
        self.argv = argv;
        self.envp = envp;
        self.exists_files = BTreeSet::from([self.cwd.clone(), exe]);
        self.written_files.clear();
        self.connects.clear();
        self.binds.clear();
        self.children.clear();
        self.unhandled.clear();
        self.exec_file = None;
        Ok(())
    }

    fn sys_clone(&mut self, call: &SyscallLine) {
        if call.ok() {
            if let Some(pid) = call.ret {
                self.children.push(Child {
                    pid,
                    cwd: self.cwd.clone(),
                });
            }
        }
    }

    fn sys_connect(&mut self, args: &str, call: &SyscallLine) -> Result<()> {
        if !call.ok() {
            return Ok(());
        }
        let (_, rest) = syscall::fd_arg(args)?;
        let (addr, _) = syscall::sockaddr_arg(syscall::next_arg(rest))?;
        // AF_UNSPEC dissolves an association rather than creating one.
        if addr != SockAddr::Unspec {
            self.connects.push(addr);
        }
        Ok(())
    }

    fn sys_bind(&mut self, args: &str, call: &SyscallLine) -> Result<()> {
        if !call.ok() {
            return Ok(());
        }
        let (_, rest) = syscall::fd_arg(args)?;
        let (addr, _) = syscall::sockaddr_arg(syscall::next_arg(rest))?;
        self.binds.push(addr);
        Ok(())
    }

    fn sys_dup(&mut self, args: &str, call: &SyscallLine) -> Result<()> {
        if !call.ok() {
            return Ok(());
        }
        let (fd, _) = syscall::fd_arg(args)?;
        if let (FdArg::Fd { fd, path }, Some(new_fd)) = (fd, call.ret) {
            let path = path.or_else(|| self.fd_paths.get(&fd).cloned());
            if let Some(path) = path {
                self.fd_paths.insert(new_fd, path);
            }
        }
        Ok(())
    }
}

/// Decode the tracer's `execve` argument string.
///
/// The payload is printed so that wrapping it in brackets yields a JSON array
/// of `[path, [argv...], [envp...]]`. Escapes that are legal in the tracer's
/// output but not in JSON are repaired by doubling the offending backslash
/// and retrying.
fn decode_execve(args: &str) -> Result<(String, Vec<String>, Vec<String>)> {
    let mut payload = format!("[{args}]");
    for _ in 0..MAX_ESCAPE_REPAIRS {
        match serde_json::from_str::<(String, Vec<String>, Vec<String>)>(&payload) {
            Ok(decoded) => return Ok(decoded),
            Err(err) if err.to_string().contains("invalid escape") => {
                let bytes = payload.as_bytes();
                let mut at = err.column().saturating_sub(1).min(bytes.len() - 1);
                while at > 0 && bytes[at] != b'\\' {
                    at -= 1;
                }
                if bytes[at] != b'\\' {
                    return Err(eyre!(err)).context("locate invalid escape in execve payload");
                }
                payload.insert(at, '\\');
            }
            Err(err) => return Err(eyre!(err)).context("parse execve payload"),
        }
    }
    bail!("execve payload not recoverable after {MAX_ESCAPE_REPAIRS} escape repairs");
}

fn dirname(path: &str) -> PathBuf {
    Path::new(path)
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .to_path_buf()
}

/// Parse a trace log into per-process execution records.
///
/// `root_cwd` seeds the working directory of the traced root process (the
/// container's configured working directory). When `container_root` is set,
/// the trace is the container init: everything before its `pivot_root` and
/// the exec that follows it happened in the host rootfs and is discarded.
///
/// Unparsable lines are logged and skipped; a short read terminates parsing
/// at the last complete line. A root-changing call outside the pivot window
/// is fatal.
pub fn parse(
    input: impl BufRead,
    root_pid: u32,
    root_cwd: impl Into<PathBuf>,
    container_root: bool,
) -> Result<BTreeMap<u32, Vec<ExecutionRecord>>> {
    let mut state = ProcessState::new(root_cwd.into(), container_root);

    for (lineno, line) in input.lines().enumerate() {
        let lineno = lineno + 1;
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(%lineno, %err, "short read; stopping at last complete line");
                break;
            }
        };

        let event = match syscall::classify(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!(%lineno, ?err, "unparsable trace line");
                continue;
            }
        };

        if let TraceEvent::Syscall(call) = &event {
            if state.mode == Mode::Live && call.name == "pivot_root" {
                bail!("root-changing call outside the container pivot window: pivot_root at line {lineno}");
            }
        }

        if let Err(err) = state.handle(&event, lineno) {
            warn!(%lineno, ?err, "trace line not interpreted");
        }
    }

    let record = state.snapshot();
    state.records.push(record);
    Ok(BTreeMap::from([(root_pid, state.records)]))
}
