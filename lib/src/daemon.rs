//! Interacts with the local Docker daemon.
//!
//! The core consumes exactly three read-only operations from the runtime:
//! inspecting an image, inspecting a container, and exporting a container's
//! root filesystem into a directory tree for the oracle to read.

use std::path::Path;

use async_tempfile::TempFile;
use bollard::{
    models::{ContainerInspectResponse, ImageInspect},
    Docker,
};
use bytes::Bytes;
use color_eyre::{eyre::Context, Result};
use derive_more::Debug;
use futures_lite::{Stream, StreamExt};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_tar::Archive;
use tracing::{debug, warn};

/// Unwrap a value, logging an error and performing the provided action if it fails.
macro_rules! unwrap_warn {
    ($expr:expr, $action:expr) => {
        unwrap_warn!($expr, $action,)
    };
    ($expr:expr, $action:expr, $($msg:tt)*) => {
        match $expr {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = ?e, $($msg)*);
                $action;
            }
        }
    };
}

/// A verified connection to the local Docker daemon.
#[derive(Debug, Clone)]
pub struct Daemon {
    #[debug(skip)]
    docker: Docker,
}

impl Daemon {
    /// Connect to the local daemon and verify it responds.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("connect to docker daemon")?;
        docker
            .version()
            .await
            .context("verify docker daemon connection")?;
        Ok(Self { docker })
    }

    /// Inspect an image by name or id.
    #[tracing::instrument(skip(self))]
    pub async fn inspect_image(&self, image: &str) -> Result<ImageInspect> {
        self.docker
            .inspect_image(image)
            .await
            .with_context(|| format!("inspect image {image}"))
    }

    /// Inspect a container by name or id.
    #[tracing::instrument(skip(self))]
    pub async fn inspect_container(&self, container: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(container, None)
            .await
            .with_context(|| format!("inspect container {container}"))
    }

    /// Export a container's root filesystem into a directory tree.
    ///
    /// The export stream is collected to a temporary file and unpacked entry
    /// by entry. Entries that cannot be recreated without privileges (device
    /// nodes, fifos) are logged and skipped; a read-only oracle tree does not
    /// need them.
    #[tracing::instrument(skip(self))]
    pub async fn export_root(&self, container: &str, dest: &Path) -> Result<()> {
        let stream = self.docker.export_container(container);
        let exported = collect_tmp(stream)
            .await
            .context("collect exported container")?;
        tokio::fs::create_dir_all(dest)
            .await
            .context("create export tree")?;

        let file = tokio::fs::File::open(exported.file_path())
            .await
            .context("open exported tar")?;
        let mut archive = Archive::new(file);
        let mut entries = archive.entries().context("read entries from export")?;
        while let Some(entry) = entries.next().await {
            let mut entry = unwrap_warn!(entry, continue, "read entry");
            let path = unwrap_warn!(entry.path(), continue, "read entry path").to_path_buf();
            if unwrap_warn!(entry.unpack_in(dest).await, continue, "unpack {path:?}").is_none() {
                warn!(?path, "skip: tried to write outside of export tree");
                continue;
            }
            debug!(?path, "export");
        }

        Ok(())
    }
}

/// Sink the stream into a temporary file.
pub async fn collect_tmp<E: std::error::Error + Send + Sync + 'static>(
    mut stream: impl Stream<Item = Result<Bytes, E>> + Unpin,
) -> Result<TempFile> {
    let file = TempFile::new().await.context("create temp file")?;
    let mut writer = BufWriter::new(file);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read chunk")?;
        writer.write_all(&chunk).await.context("write chunk")?;
    }
    writer.flush().await.context("flush writer")?;

    let file = writer.into_inner();
    file.sync_all().await.context("sync file")?;
    Ok(file)
}
