use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use tracing::info;
use whittle_lib::Slim;

#[derive(Debug, Parser)]
pub struct Options {
    /// Original image to debloat (e.g. redis:latest)
    image: String,

    /// The container the trace was collected from
    container: String,

    /// Pid of the traced root process inside the container
    #[arg(long)]
    root_pid: u32,

    /// Path to the collected trace log (per-pid files concatenated)
    #[arg(long)]
    trace_log: PathBuf,

    /// Prefix for the produced image tar and report
    #[arg(long, default_value = "slim")]
    prefix: String,

    /// Directory outputs are written to
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// Re-home retained volume mounts under this directory
    #[arg(long)]
    volume_root: Option<PathBuf>,

    /// Treat the trace as the container init: discard everything before its
    /// pivot_root and the exec that follows
    #[arg(long)]
    container_root: bool,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    info!("debloating image");
    let report = Slim::builder()
        .image(opts.image)
        .prefix(opts.prefix)
        .container(opts.container)
        .root_pid(opts.root_pid)
        .trace_log(opts.trace_log)
        .maybe_volume_override(opts.volume_root)
        .container_root(opts.container_root)
        .output(opts.output)
        .build()
        .run()
        .await
        .context("debloat image")?;

    for (name, entry) in &report.config {
        info!(
            image = %name,
            cmd = %entry.cmd,
            envkeys = entry.envkeys.len(),
            mounts = entry.vols.len(),
            "image ready"
        );
    }
    Ok(())
}
