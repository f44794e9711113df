//! Reduces the container's declared manifest to what the trace shows was
//! actually needed.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use bollard::models::MountPoint;
use color_eyre::{eyre::Context, Result};
use memchr::memmem;

use crate::ext::PathExt;

/// Retain only the environment variable names whose UTF-8 byte sequence
/// appears in at least one of the given files.
///
/// A program that never references a variable's name as a literal byte string
/// almost certainly does not read it. The scan errs toward keeping: a false
/// positive costs an unused variable, a false negative would break the
/// container. Variables consulted only through files mounted at runtime are
/// a known blind spot.
pub fn reduce_environ(
    files: impl IntoIterator<Item = PathBuf>,
    env_keys: &BTreeSet<String>,
) -> Result<BTreeSet<String>> {
    let mut missing: BTreeSet<&String> = env_keys.iter().collect();
    let mut retained = BTreeSet::new();

    for file in files {
        if missing.is_empty() {
            break;
        }
        let contents = fs::read(&file).with_context(|| format!("read {}", file.display()))?;
        missing.retain(|key| {
            if memmem::find(&contents, key.as_bytes()).is_some() {
                retained.insert((*key).clone());
                false
            } else {
                true
            }
        });
    }

    Ok(retained)
}

/// Retain a mount when any accessed path is the mount destination itself or a
/// descendant of it. `files` holds absolute container paths.
pub fn reduce_volumes(files: &BTreeSet<PathBuf>, mounts: Vec<MountPoint>) -> Vec<MountPoint> {
    mounts
        .into_iter()
        .filter(|mount| {
            let Some(destination) = mount.destination.as_deref() else {
                return false;
            };
            volume_accessed(files, Path::new(destination))
        })
        .collect()
}

/// Whether any accessed path sits at or below the mount destination.
pub fn volume_accessed(files: &BTreeSet<PathBuf>, destination: &Path) -> bool {
    files.iter().any(|file| file.under(destination))
}
