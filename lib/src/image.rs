//! Emits a legacy single-layer image the runtime can `load`.
//!
//! The on-disk staging layout is `<name>/<layer-id>/{VERSION,json,layer.tar}`
//! plus `<name>/repositories`, wrapped into a top-level `<name>.tar`. The
//! layer tar carries exactly the member paths it is given: directories as
//! single entries, symlinks preserved, and every parent directory appearing
//! before its children.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use bollard::models::ImageInspect;
use bon::Builder;
use chrono::Utc;
use color_eyre::{eyre::Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_tar::Builder as TarBuilder;
use tracing::{debug, info};

/// A 64-hex-digit layer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerId(String);

impl LayerId {
    /// Generate a random identifier.
    pub fn random() -> Self {
        Self::from_bytes(rand::thread_rng().gen())
    }

    /// Build an identifier from raw bytes. Hex encoding keeps the rendered
    /// form at 64 zero-padded digits.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The runtime configuration block of the legacy metadata format.
///
/// Field names and defaults follow the v1 image spec; the main image carries
/// `Env`, `Cmd`, `Entrypoint`, `WorkingDir`, and `ExposedPorts` over from the
/// source image, everything else stays at its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    pub attach_stderr: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub cmd: Option<Vec<String>>,
    pub domainname: String,
    pub entrypoint: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    pub hostname: String,
    pub image: String,
    pub labels: Option<BTreeMap<String, String>>,
    pub mac_address: String,
    pub network_disabled: bool,
    pub on_build: Option<Vec<String>>,
    pub open_stdin: bool,
    pub publish_service: String,
    pub stdin_once: bool,
    pub tty: bool,
    pub user: String,
    pub volume_driver: String,
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    pub working_dir: String,
}

impl RuntimeConfig {
    /// The no-op container config recorded for synthesized layers.
    pub fn nop() -> Self {
        Self {
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "#(nop) ADD files in /".to_string(),
            ]),
            ..Self::default()
        }
    }
}

/// The metadata blob stored as `json` next to each layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    pub architecture: String,
    pub config: RuntimeConfig,
    pub container: String,
    pub container_config: RuntimeConfig,
    pub created: String,
    pub docker_version: String,
    pub id: LayerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<LayerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub os: String,
}

impl LayerMetadata {
    /// Fresh metadata for a synthesized layer.
    pub fn synthesized(id: LayerId) -> Self {
        Self {
            architecture: "amd64".to_string(),
            config: RuntimeConfig::default(),
            container: String::new(),
            container_config: RuntimeConfig::nop(),
            created: Utc::now().to_rfc3339(),
            docker_version: "1.9.0".to_string(),
            id,
            parent: None,
            author: None,
            os: "linux".to_string(),
        }
    }

    /// Carry the runtime-relevant parts of the source image's configuration
    /// into this metadata. Used for the main image so the debloated container
    /// starts the same way the original did.
    pub fn carry_over(&mut self, inspect: &ImageInspect) {
        if let Some(author) = &inspect.author {
            self.author = Some(author.clone());
        }
        let Some(config) = &inspect.config else {
            return;
        };
        self.config.env = config.env.clone();
        self.config.cmd = config.cmd.clone();
        self.config.entrypoint = config.entrypoint.clone();
        self.config.working_dir = config.working_dir.clone().unwrap_or_default();
        self.config.exposed_ports = config.exposed_ports.as_ref().map(|ports| {
            ports
                .keys()
                .map(|port| (port.clone(), serde_json::json!({})))
                .collect()
        });
    }
}

/// Writes one debloated image: a staged skeleton plus the wrapping tar.
#[derive(Debug, Builder)]
pub struct ImageWriter {
    /// Image name; becomes the repository key and the staging directory name.
    #[builder(into)]
    pub name: String,

    /// The exported root tree layer members are taken from.
    #[builder(into)]
    pub tree: PathBuf,

    /// Directory the staging skeleton and the final tar are created in.
    #[builder(into)]
    pub output: PathBuf,

    /// Member paths for the single layer, relative to the tree and sorted so
    /// parents precede children.
    pub members: Vec<PathBuf>,

    /// Paths a companion mechanism provides; excluded from the layer.
    #[builder(default)]
    pub stub_paths: BTreeSet<PathBuf>,

    /// The main binary of this image. Never treated as a stub, even when the
    /// stub set names it.
    pub self_exe: Option<PathBuf>,

    /// Source image whose runtime configuration the main image carries over.
    pub source_image: Option<ImageInspect>,

    /// Identifier for the emitted layer; random unless pinned.
    #[builder(default = LayerId::random())]
    pub layer_id: LayerId,
}

impl ImageWriter {
    /// Write the staged image and wrap it into `<output>/<name>.tar`.
    ///
    /// The final tar becomes visible atomically: it is written under a
    /// partial name and renamed once complete.
    #[tracing::instrument(skip(self), fields(name = %self.name))]
    pub async fn write(&self) -> Result<PathBuf> {
        let staging = self.output.join(&self.name);
        let layer_dir = staging.join(self.layer_id.as_str());
        tokio::fs::create_dir_all(&layer_dir)
            .await
            .context("create layer directory")?;

        tokio::fs::write(layer_dir.join("VERSION"), b"1.0")
            .await
            .context("write VERSION")?;

        let mut metadata = LayerMetadata::synthesized(self.layer_id.clone());
        if let Some(inspect) = &self.source_image {
            metadata.carry_over(inspect);
        }
        let rendered = serde_json::to_string(&metadata).context("serialize layer metadata")?;
        tokio::fs::write(layer_dir.join("json"), rendered)
            .await
            .context("write layer metadata")?;

        self.write_layer_tar(&layer_dir.join("layer.tar"))
            .await
            .context("write layer tar")?;

        let repositories: BTreeMap<&str, BTreeMap<&str, &LayerId>> = BTreeMap::from([(
            self.name.as_str(),
            BTreeMap::from([("latest", &self.layer_id)]),
        )]);
        let rendered = serde_json::to_string(&repositories).context("serialize repositories")?;
        tokio::fs::write(staging.join("repositories"), rendered)
            .await
            .context("write repositories")?;

        let dest = self.output.join(format!("{}.tar", self.name));
        self.write_image_tar(&staging, &dest)
            .await
            .context("write image tar")?;
        info!(image = %dest.display(), "image written");
        Ok(dest)
    }

    /// Write the layer tar with explicit members only: no recursion into
    /// directories, no symlink following. Members missing from the tree are
    /// skipped; the closure may name paths that only existed mid-run.
    async fn write_layer_tar(&self, dest: &Path) -> Result<()> {
        let file = tokio::fs::File::create(dest)
            .await
            .context("create layer tar")?;
        let mut builder = TarBuilder::new(file);
        builder.follow_symlinks(false);

        let mut count = 0usize;
        for member in &self.members {
            if self.stub_paths.contains(member) && Some(member) != self.self_exe.as_ref() {
                debug!(member = %member.display(), "skip: provided by stub");
                continue;
            }
            let full = self.tree.join(member);
            if tokio::fs::symlink_metadata(&full).await.is_err() {
                debug!(member = %member.display(), "skip: not in tree");
                continue;
            }
            builder
                .append_path_with_name(&full, member)
                .await
                .with_context(|| format!("append {}", member.display()))?;
            count += 1;
        }

        let file = builder.into_inner().await.context("finish layer tar")?;
        file.sync_all().await.context("sync layer tar")?;
        debug!(members = count, "layer tar written");
        Ok(())
    }

    /// Wrap the staged directory into the final image tar, then rename it
    /// into place.
    async fn write_image_tar(&self, staging: &Path, dest: &Path) -> Result<()> {
        let partial = dest.with_extension("tar.partial");
        let file = tokio::fs::File::create(&partial)
            .await
            .context("create image tar")?;
        let mut builder = TarBuilder::new(file);
        builder.follow_symlinks(false);

        let mut entries = tokio::fs::read_dir(staging)
            .await
            .context("list staging directory")?;
        while let Some(entry) = entries.next_entry().await.context("read staging entry")? {
            let name = PathBuf::from(entry.file_name());
            let metadata = entry.metadata().await.context("stat staging entry")?;
            if metadata.is_dir() {
                builder
                    .append_dir_all(&name, entry.path())
                    .await
                    .with_context(|| format!("append layer directory {}", name.display()))?;
            } else {
                builder
                    .append_path_with_name(entry.path(), &name)
                    .await
                    .with_context(|| format!("append {}", name.display()))?;
            }
        }

        let file = builder.into_inner().await.context("finish image tar")?;
        file.sync_all().await.context("sync image tar")?;
        tokio::fs::rename(&partial, dest)
            .await
            .context("publish image tar")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::StreamExt;
    use pretty_assertions::assert_eq;
    use std::{fs, os::unix::fs::symlink};
    use tokio_tar::{Archive, EntryType};

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("create tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("usr/bin")).expect("mkdir usr/bin");
        fs::create_dir_all(root.join("bin")).expect("mkdir bin");
        fs::create_dir_all(root.join("etc")).expect("mkdir etc");
        fs::write(root.join("usr/bin/true"), b"ELF").expect("write true");
        fs::write(root.join("usr/bin/untraced"), b"ELF").expect("write untraced");
        fs::write(root.join("etc/hosts"), b"127.0.0.1 localhost").expect("write hosts");
        symlink("../usr/bin/true", root.join("bin/true")).expect("link true");
        dir
    }

    async fn entry_list(tar: &Path) -> Vec<(PathBuf, EntryType)> {
        let file = tokio::fs::File::open(tar).await.expect("open tar");
        let mut archive = Archive::new(file);
        let mut entries = archive.entries().expect("read entries");
        let mut listed = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry.expect("read entry");
            let path = entry.path().expect("entry path").to_path_buf();
            listed.push((path, entry.header().entry_type()));
        }
        listed
    }

    #[test_log::test(tokio::test)]
    async fn layer_tar_members_are_explicit_and_ordered() {
        let tree = tree();
        let output = tempfile::tempdir().expect("create output dir");
        let members = vec![
            PathBuf::from("bin"),
            PathBuf::from("bin/true"),
            PathBuf::from("etc"),
            PathBuf::from("usr"),
            PathBuf::from("usr/bin"),
            PathBuf::from("usr/bin/true"),
        ];

        let writer = ImageWriter::builder()
            .name("slim")
            .tree(tree.path())
            .output(output.path())
            .members(members)
            .layer_id(LayerId::from_bytes([0; 32]))
            .build();
        writer.write().await.expect("write image");

        let layer = output
            .path()
            .join("slim")
            .join(writer.layer_id.as_str())
            .join("layer.tar");
        let entries = entry_list(&layer).await;
        let paths: Vec<&PathBuf> = entries.iter().map(|(path, _)| path).collect();

        // Every parent directory precedes its children.
        for (index, (path, _)) in entries.iter().enumerate() {
            for ancestor in path.ancestors().skip(1) {
                if ancestor.as_os_str().is_empty() {
                    continue;
                }
                let position = entries
                    .iter()
                    .position(|(other, _)| other == ancestor)
                    .unwrap_or(usize::MAX);
                assert!(position < index, "{ancestor:?} after {path:?}");
            }
        }

        // Directories are not expanded: the untraced sibling stays out.
        assert!(!paths.iter().any(|path| path.ends_with("untraced")));
        // etc was listed without its children; it appears as a bare directory.
        assert!(paths.iter().any(|path| *path == &PathBuf::from("etc")));
        assert!(!paths.iter().any(|path| path.ends_with("hosts")));

        // The symlink survives as a link entry.
        let (_, kind) = entries
            .iter()
            .find(|(path, _)| path == &PathBuf::from("bin/true"))
            .expect("bin/true entry");
        assert_eq!(*kind, EntryType::Symlink);
    }

    #[test_log::test(tokio::test)]
    async fn skeleton_and_repositories_round_trip() {
        let tree = tree();
        let output = tempfile::tempdir().expect("create output dir");
        let writer = ImageWriter::builder()
            .name("slim")
            .tree(tree.path())
            .output(output.path())
            .members(vec![PathBuf::from("etc")])
            .layer_id(LayerId::from_bytes([7; 32]))
            .build();
        let image_tar = writer.write().await.expect("write image");
        assert!(image_tar.ends_with("slim.tar"));

        let staging = output.path().join("slim");
        let layer_dir = staging.join(writer.layer_id.as_str());

        let version = fs::read_to_string(layer_dir.join("VERSION")).expect("read VERSION");
        assert_eq!(version, "1.0");

        let rendered = fs::read_to_string(layer_dir.join("json")).expect("read metadata");
        let metadata: LayerMetadata = serde_json::from_str(&rendered).expect("parse metadata");
        assert_eq!(metadata.id, writer.layer_id);
        assert_eq!(metadata.architecture, "amd64");
        assert_eq!(metadata.os, "linux");
        assert_eq!(metadata.container_config, RuntimeConfig::nop());
        // Re-rendering the parsed object yields the same bytes.
        assert_eq!(
            serde_json::to_string(&metadata).expect("serialize metadata"),
            rendered
        );

        let repositories = fs::read_to_string(staging.join("repositories")).expect("repositories");
        let parsed: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_str(&repositories).expect("parse repositories");
        assert_eq!(
            parsed
                .get("slim")
                .and_then(|tags| tags.get("latest"))
                .map(String::as_str),
            Some(writer.layer_id.as_str()),
        );

        // The outer tar carries the layer triple and the repositories file.
        let entries = entry_list(&image_tar).await;
        let paths: Vec<&PathBuf> = entries.iter().map(|(path, _)| path).collect();
        assert!(paths.iter().any(|path| *path == &PathBuf::from("repositories")));
        for part in ["VERSION", "json", "layer.tar"] {
            let expected = PathBuf::from(writer.layer_id.as_str()).join(part);
            assert!(
                paths.iter().any(|path| **path == expected),
                "missing {expected:?}"
            );
        }
    }

    #[test_log::test(tokio::test)]
    async fn stub_paths_are_excluded_except_the_self_exe() {
        let tree = tree();
        let output = tempfile::tempdir().expect("create output dir");
        let members = vec![
            PathBuf::from("etc"),
            PathBuf::from("etc/hosts"),
            PathBuf::from("usr"),
            PathBuf::from("usr/bin"),
            PathBuf::from("usr/bin/true"),
        ];
        let stubs: BTreeSet<PathBuf> = [PathBuf::from("etc/hosts"), PathBuf::from("usr/bin/true")]
            .into_iter()
            .collect();

        let writer = ImageWriter::builder()
            .name("slim")
            .tree(tree.path())
            .output(output.path())
            .members(members)
            .stub_paths(stubs)
            .self_exe(PathBuf::from("usr/bin/true"))
            .layer_id(LayerId::from_bytes([9; 32]))
            .build();
        writer.write().await.expect("write image");

        let layer = output
            .path()
            .join("slim")
            .join(writer.layer_id.as_str())
            .join("layer.tar");
        let entries = entry_list(&layer).await;
        let paths: Vec<&PathBuf> = entries.iter().map(|(path, _)| path).collect();
        assert!(
            !paths.iter().any(|path| path.ends_with("hosts")),
            "stub paths stay out of the layer"
        );
        assert!(
            paths.iter().any(|path| path.ends_with("true")),
            "the self exe is kept even when the stub set names it"
        );
    }

    #[test_log::test(tokio::test)]
    async fn carry_over_copies_runtime_config() {
        use bollard::models::ContainerConfig;

        let mut metadata = LayerMetadata::synthesized(LayerId::from_bytes([1; 32]));
        let inspect = ImageInspect {
            config: Some(ContainerConfig {
                env: Some(vec!["PATH=/usr/bin".to_string()]),
                cmd: Some(vec!["redis-server".to_string()]),
                entrypoint: Some(vec!["/entry.sh".to_string()]),
                working_dir: Some("/srv".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        metadata.carry_over(&inspect);

        assert_eq!(metadata.config.env, Some(vec!["PATH=/usr/bin".to_string()]));
        assert_eq!(metadata.config.cmd, Some(vec!["redis-server".to_string()]));
        assert_eq!(
            metadata.config.entrypoint,
            Some(vec!["/entry.sh".to_string()])
        );
        assert_eq!(metadata.config.working_dir, "/srv");
        // Everything else stays at the template default.
        assert_eq!(metadata.config.user, "");
        assert_eq!(metadata.architecture, "amd64");
    }
}
