//! Read-only view over the exported root tree of the original container.
//!
//! Every resolution happens relative to the exported root: an absolute link
//! target `/foo` means `<root>/foo`, never the host's `/foo`. The host
//! filesystem outside the root is never consulted.

use std::{
    fs,
    io::{BufRead, BufReader, Read},
    path::{Component, Path, PathBuf},
};

use tracing::warn;

use crate::ext::{normalize, strip_root};

/// Read-only oracle over an exported container root.
///
/// Paths handed to the oracle are relative to the export root; absolute paths
/// are accepted and re-rooted by stripping their leading slash.
#[derive(Debug, Clone)]
pub struct Oracle {
    root: PathBuf,
}

impl Oracle {
    /// Symlink chains longer than this are abandoned mid-resolution.
    const MAX_LINK_HOPS: usize = 40;

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The exported root this oracle reads.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The on-disk location of a root-relative path.
    pub fn host_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(strip_root(path))
    }

    /// Resolve symlinks component by component, relative to the export root.
    ///
    /// An absolute link target is re-rooted; a relative target is joined to
    /// the link's directory. Chains are followed up to a fixed hop bound per
    /// component; a chain that exceeds it is left unresolved where it stands.
    pub fn rooted_realpath(&self, path: impl AsRef<Path>) -> PathBuf {
        let mut resolved = PathBuf::new();
        for component in normalize(strip_root(path)).components() {
            match component {
                Component::CurDir => continue,
                Component::ParentDir if resolved.as_os_str().is_empty() => continue,
                _ => {}
            }
            resolved.push(component);

            let mut hops = 0;
            while let Ok(target) = fs::read_link(self.root.join(&resolved)) {
                hops += 1;
                if hops > Self::MAX_LINK_HOPS {
                    warn!(
                        path = %resolved.display(),
                        "symlink chain exceeds bound; leaving unresolved"
                    );
                    break;
                }
                resolved = if target.is_absolute() {
                    strip_root(&target)
                } else {
                    let parent = resolved.parent().unwrap_or_else(|| Path::new(""));
                    normalize(parent.join(&target))
                };
            }
        }
        resolved
    }

    /// Whether the path exists in the export, following links inside the root.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.lexists(self.rooted_realpath(path))
    }

    /// Whether the path itself exists, without following a final link.
    pub fn lexists(&self, path: impl AsRef<Path>) -> bool {
        fs::symlink_metadata(self.host_path(path)).is_ok()
    }

    /// Whether the path itself is a symbolic link.
    pub fn is_link(&self, path: impl AsRef<Path>) -> bool {
        fs::symlink_metadata(self.host_path(path))
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
    }

    /// Whether the path ultimately names a regular file.
    pub fn is_regular(&self, path: impl AsRef<Path>) -> bool {
        fs::symlink_metadata(self.host_path(self.rooted_realpath(path)))
            .map(|meta| meta.file_type().is_file())
            .unwrap_or(false)
    }

    /// Whether the path ultimately names a directory.
    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        fs::symlink_metadata(self.host_path(self.rooted_realpath(path)))
            .map(|meta| meta.file_type().is_dir())
            .unwrap_or(false)
    }

    /// The raw target of a symlink, if the path is one.
    pub fn read_link(&self, path: impl AsRef<Path>) -> Option<PathBuf> {
        fs::read_link(self.host_path(path)).ok()
    }

    /// The interpreter named by a `#!` header, if the file has one.
    ///
    /// The file is located through the oracle's own link resolution, so a
    /// link whose absolute target escapes the export yields `None` rather
    /// than consulting the host.
    pub fn read_interpreter(&self, path: impl AsRef<Path>) -> Option<PathBuf> {
        let resolved = self.rooted_realpath(path);
        let file = fs::File::open(self.host_path(&resolved)).ok()?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 2];
        reader.read_exact(&mut magic).ok()?;
        if &magic != b"#!" {
            return None;
        }

        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).ok()?;
        String::from_utf8_lossy(&line)
            .split_whitespace()
            .next()
            .map(PathBuf::from)
    }
}
