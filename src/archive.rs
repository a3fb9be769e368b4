//! Static GTFS source preparation: download, zip extraction, or a directory in place.

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::fetch::{fetch_source, is_remote};

/// Extracts every file of a zip archive directly into `dest`, dropping any
/// directory components so the GTFS tables land side by side.
///
/// Returns the number of files written.
pub fn extract_archive(bytes: &[u8], dest: &Path) -> Result<usize> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("static source is not a zip archive")?;
    std::fs::create_dir_all(dest)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_owned()))
        else {
            warn!(entry = entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };
        let target = dest.join(&name);
        let mut out = std::fs::File::create(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to extract {}", entry.name()))?;
        written += 1;
    }
    debug!(files = written, dest = %dest.display(), "Archive extracted");
    Ok(written)
}

/// Makes the static feed available as a directory of `.txt` files.
///
/// A local directory is used in place. Anything else is read (or downloaded
/// with `headers`) as a zip archive and extracted into `work_dir/gtfs`.
#[tracing::instrument(skip(headers, work_dir))]
pub async fn prepare_static(
    source: &str,
    headers: &BTreeMap<String, String>,
    work_dir: &Path,
) -> Result<PathBuf> {
    if !is_remote(source) {
        let path = Path::new(source);
        if path.is_dir() {
            info!("Using unpacked static feed in place");
            return Ok(path.to_path_buf());
        }
        if !path.is_file() {
            bail!("static source {source} does not exist");
        }
    }

    let bytes = fetch_source(source, headers).await?;
    let dest = work_dir.join("gtfs");
    let files = tokio::task::spawn_blocking({
        let dest = dest.clone();
        move || extract_archive(&bytes, &dest)
    })
    .await??;
    info!(files, "Static feed extracted");
    Ok(dest)
}
