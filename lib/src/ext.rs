use std::path::{Component, Path, PathBuf};

use tap::Pipe;

/// Lexically normalize a path.
///
/// Collapses `.` components and redundant separators, and resolves `..`
/// against the preceding component without touching the filesystem.
/// `..` at the root is discarded; leading `..` on a relative path is kept.
/// An empty input normalizes to `.`.
pub fn normalize(path: impl AsRef<Path>) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }

    if out.is_empty() {
        PathBuf::from(".")
    } else {
        out.into_iter().collect()
    }
}

/// Strips any root and prefix from a path, if they exist.
///
/// Trace paths are absolute within the container; the same files live in the
/// exported tree and the layer tar addressed without the leading slash.
pub fn strip_root(path: impl AsRef<Path>) -> PathBuf {
    path.as_ref()
        .components()
        .filter(|c| {
            !matches!(
                c,
                std::path::Component::Prefix(_) | std::path::Component::RootDir
            )
        })
        .pipe(PathBuf::from_iter)
}

/// Extension methods for container-rooted paths.
pub trait PathExt {
    /// The path relative to the export root: the same path with its root
    /// component removed.
    fn rootless(&self) -> PathBuf;

    /// Whether this path equals `ancestor` or is a descendant of it.
    /// The comparison is component-wise, so `/database` is not under `/data`.
    fn under(&self, ancestor: impl AsRef<Path>) -> bool;
}

impl PathExt for Path {
    fn rootless(&self) -> PathBuf {
        strip_root(self)
    }

    fn under(&self, ancestor: impl AsRef<Path>) -> bool {
        self.starts_with(ancestor)
    }
}
