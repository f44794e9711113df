//! The debloat driver: one traced run in, one slimmed image out.
//!
//! `Slim::run` wires the pipeline together in order: inspect the container,
//! parse the trace, materialize the exported root, merge the generations into
//! an access set, close over the filesystem, emit the image, and reduce the
//! manifest. Everything feeds the next step through memory; there is no
//! concurrency inside a run.

use std::{
    collections::BTreeMap,
    io::BufReader,
    path::{Path, PathBuf},
};

use bollard::models::{ContainerInspectResponse, MountPoint};
use bon::Builder;
use color_eyre::{
    eyre::{ensure, Context},
    Result,
};
use serde::Serialize;
use tracing::info;
use walkdir::WalkDir;

use crate::{
    closure::{self, AccessSet},
    daemon::Daemon,
    ext::strip_root,
    image::ImageWriter,
    oracle::Oracle,
    reduce, trace,
};

/// Mount sources under this root belong to the runtime's volume store and are
/// re-homed when a volume override is requested.
const VOLUME_STORE: &str = "/var/lib/docker/volumes";

/// Companion report written next to the image tar. The outer driver uses it
/// to recreate the container from the debloated image.
#[derive(Debug, Serialize)]
pub struct SlimReport {
    /// Per produced image, how to run it.
    pub config: BTreeMap<String, ImageEntry>,

    /// The original container's inspect output, verbatim.
    pub original_container: ContainerInspectResponse,
}

/// How to recreate a container from one produced image.
#[derive(Debug, Serialize)]
pub struct ImageEntry {
    /// Environment variable names the workload was observed to need.
    pub envkeys: Vec<String>,

    /// Mounts the workload actually used.
    pub vols: Vec<MountPoint>,

    /// Working directory declared on the original container.
    pub wd: String,

    /// Command to run: the resolved path of the traced executable.
    pub cmd: String,

    /// Whether this is the workload's main image.
    pub ismain: bool,
}

/// Inputs for one debloat run.
#[derive(Debug, Builder)]
pub struct Slim {
    /// Original image name.
    #[builder(into)]
    pub image: String,

    /// Prefix for the produced `<prefix>.tar` and `<prefix>.json`.
    #[builder(into)]
    pub prefix: String,

    /// The container the trace was collected from.
    #[builder(into)]
    pub container: String,

    /// Pid of the traced root process.
    pub root_pid: u32,

    /// The collected trace log, per-pid files already concatenated.
    #[builder(into)]
    pub trace_log: PathBuf,

    /// Re-home retained volume-store mounts under this directory.
    #[builder(into)]
    pub volume_override: Option<PathBuf>,

    /// Treat the trace as the container init: discard everything before its
    /// `pivot_root` and the exec that follows.
    #[builder(default)]
    pub container_root: bool,

    /// Directory the image tar and report are written to. Defaults to the
    /// current directory.
    #[builder(into)]
    pub output: Option<PathBuf>,
}

impl Slim {
    /// Run the pipeline and write `<prefix>.tar` plus `<prefix>.json`.
    ///
    /// On a fatal error nothing is published: both artifacts are written
    /// under partial names and renamed only when complete.
    #[tracing::instrument(skip(self), fields(image = %self.image, container = %self.container))]
    pub async fn run(&self) -> Result<SlimReport> {
        ensure!(
            tokio::fs::try_exists(&self.trace_log).await.unwrap_or(false),
            "trace log does not exist: {}",
            self.trace_log.display(),
        );

        let daemon = Daemon::connect().await?;
        let container = daemon.inspect_container(&self.container).await?;
        let image = daemon.inspect_image(&self.image).await?;

        let declared_workdir = container
            .config
            .as_ref()
            .and_then(|config| config.working_dir.clone())
            .unwrap_or_default();
        let root_cwd = if declared_workdir.is_empty() {
            "/".to_string()
        } else {
            declared_workdir.clone()
        };

        let file = std::fs::File::open(&self.trace_log)
            .with_context(|| format!("open trace log {}", self.trace_log.display()))?;
        let records = trace::parse(
            BufReader::new(file),
            self.root_pid,
            &root_cwd,
            self.container_root,
        )
        .context("parse trace")?;
        info!(
            processes = records.len(),
            generations = records.values().map(Vec::len).sum::<usize>(),
            "trace parsed"
        );

        let scratch = tempfile::tempdir().context("create working directory")?;
        let tree = scratch.path().join("rootfs");
        daemon
            .export_root(&self.container, &tree)
            .await
            .context("export container root")?;
        let oracle = Oracle::new(&tree);

        let access = AccessSet::merge_all(&oracle, records.values().flatten())
            .context("merge execution records")?;
        let kept = closure::existing_subset(&oracle, access.touched());
        let members = closure::closure(&oracle, kept.iter().cloned());
        info!(members = members.len(), "computed file closure");

        let output = self.output.clone().unwrap_or_else(|| PathBuf::from("."));
        ImageWriter::builder()
            .name(&*self.prefix)
            .tree(&tree)
            .output(&output)
            .members(members.clone())
            .self_exe(oracle.rooted_realpath(&access.exe))
            .source_image(image)
            .build()
            .write()
            .await
            .context("write image")?;

        // Only bytes that are actually in the image can reference a variable.
        let regular_files = members
            .iter()
            .filter(|member| oracle.is_regular(member))
            .map(|member| oracle.host_path(oracle.rooted_realpath(member)))
            .collect::<Vec<_>>();
        let envkeys = reduce::reduce_environ(regular_files, &access.env_keys)
            .context("reduce environment")?;

        let mounts = container.mounts.clone().unwrap_or_default();
        let mut vols = reduce::reduce_volumes(&access.exists_files, mounts);
        if let Some(override_root) = &self.volume_override {
            self.rehome_volumes(&tree, override_root, &mut vols)
                .context("re-home volumes")?;
        }

        let cmd = Path::new("/")
            .join(oracle.rooted_realpath(&access.exe))
            .display()
            .to_string();
        let entry = ImageEntry {
            envkeys: envkeys.into_iter().collect(),
            vols,
            wd: declared_workdir,
            cmd,
            ismain: access.is_main,
        };
        let report = SlimReport {
            config: BTreeMap::from([(self.prefix.clone(), entry)]),
            original_container: container,
        };
        self.write_report(&output, &report).await?;

        Ok(report)
    }

    /// Rewrite retained volume-store mounts to live under the override root,
    /// materializing each mount's exported subtree there so the recreated
    /// container sees the same data.
    fn rehome_volumes(
        &self,
        tree: &Path,
        override_root: &Path,
        vols: &mut [MountPoint],
    ) -> Result<()> {
        for vol in vols {
            let (Some(source), Some(destination)) = (&vol.source, &vol.destination) else {
                continue;
            };
            if !source.starts_with(VOLUME_STORE) {
                continue;
            }
            let new_source = override_root.join(strip_root(destination));
            let subtree = tree.join(strip_root(destination));
            copy_tree(&subtree, &new_source)
                .with_context(|| format!("materialize volume {destination}"))?;
            info!(%destination, source = %new_source.display(), "re-homed volume");
            vol.source = Some(new_source.display().to_string());
        }
        Ok(())
    }

    /// Publish the companion report atomically next to the image tar.
    async fn write_report(&self, output: &Path, report: &SlimReport) -> Result<()> {
        let rendered = serde_json::to_string_pretty(report).context("serialize report")?;
        let dest = output.join(format!("{}.json", self.prefix));
        let partial = dest.with_extension("json.partial");
        tokio::fs::write(&partial, rendered)
            .await
            .context("write report")?;
        tokio::fs::rename(&partial, &dest)
            .await
            .context("publish report")?;
        info!(report = %dest.display(), "report written");
        Ok(())
    }
}

/// Copy a directory tree, preserving symlinks as symlinks. A destination that
/// already exists is left untouched; a missing source yields an empty
/// destination directory.
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dest).context("create destination directory")?;
    if !source.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.context("walk source tree")?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("strip source prefix")?;
        let target = dest.join(relative);
        let kind = entry.file_type();
        if kind.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("create {}", target.display()))?;
        } else if kind.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .with_context(|| format!("read link {}", entry.path().display()))?;
            std::os::unix::fs::symlink(link, &target)
                .with_context(|| format!("create link {}", target.display()))?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", target.display()))?;
        }
    }
    Ok(())
}
