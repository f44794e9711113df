use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use futures_lite::StreamExt;
use tokio_tar::Archive;
use tracing::info;

#[derive(Debug, Parser)]
pub struct Options {
    /// Image tar of the original image (docker save or whittle slim output)
    original: PathBuf,

    /// Image tar of the debloated image
    debloated: PathBuf,

    /// Directory the CSV listings are written to
    #[arg(long, default_value = ".")]
    output: PathBuf,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    let original = image_files(&opts.original)
        .await
        .with_context(|| format!("list files of {}", opts.original.display()))?;
    let debloated = image_files(&opts.debloated)
        .await
        .with_context(|| format!("list files of {}", opts.debloated.display()))?;

    tokio::fs::create_dir_all(&opts.output)
        .await
        .context("create output directory")?;

    let listing = write_listing(&opts.output, &opts.original, &original)?;
    info!(listing = %listing.display(), files = original.len(), "original listed");
    let listing = write_listing(&opts.output, &opts.debloated, &debloated)?;
    info!(listing = %listing.display(), files = debloated.len(), "debloated listed");

    let common: BTreeMap<&String, &u64> = original
        .iter()
        .filter(|(path, _)| debloated.contains_key(*path))
        .collect();
    let dest = opts
        .output
        .join(format!("{}_common.csv", stem(&opts.original)));
    let mut writer = csv::Writer::from_path(&dest).context("create common csv")?;
    writer.write_record(["name", "size"]).context("write header")?;
    for (name, size) in &common {
        writer
            .write_record([name.as_str(), &size.to_string()])
            .context("write record")?;
    }
    writer.flush().context("flush common csv")?;
    info!(listing = %dest.display(), files = common.len(), "common files listed");

    Ok(())
}

/// Enumerate the files of an image tar: the union of the members of every
/// embedded `layer.tar`, mapped to their sizes.
async fn image_files(tar: &Path) -> Result<BTreeMap<String, u64>> {
    let file = tokio::fs::File::open(tar).await.context("open image tar")?;
    let mut archive = Archive::new(file);
    let mut entries = archive.entries().context("read image entries")?;

    let mut files = BTreeMap::new();
    while let Some(entry) = entries.next().await {
        let entry = entry.context("read image entry")?;
        let path = entry.path().context("read entry path")?.to_path_buf();
        if path.file_name() != Some("layer.tar".as_ref()) {
            continue;
        }

        let mut layer = Archive::new(entry);
        let mut members = layer.entries().context("read layer entries")?;
        while let Some(member) = members.next().await {
            let member = member.context("read layer member")?;
            let name = member
                .path()
                .context("read member path")?
                .to_string_lossy()
                .to_string();
            let size = member.header().size().unwrap_or(0);
            files.insert(name, size);
        }
    }

    Ok(files)
}

fn write_listing(output: &Path, image: &Path, files: &BTreeMap<String, u64>) -> Result<PathBuf> {
    let dest = output.join(format!("{}.csv", stem(image)));
    let mut writer = csv::Writer::from_path(&dest).context("create csv")?;
    writer.write_record(["name", "size"]).context("write header")?;
    for (name, size) in files {
        writer
            .write_record([name.as_str(), &size.to_string()])
            .context("write record")?;
    }
    writer.flush().context("flush csv")?;
    Ok(dest)
}

fn stem(image: &Path) -> String {
    image
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string())
}
