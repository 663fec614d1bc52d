//! HttpZipFetcher - リモートの zip から画像を取り込む ArchiveFetcher
//!
//! zip はメモリに載せず、無名の一時ファイルに流してから展開する

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::domain::MosaicError;
use crate::ports::ArchiveFetcher;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff"];

pub fn is_image_file_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

#[derive(Debug, Clone, Default)]
pub struct HttpZipFetcher {
    client: reqwest::Client,
}

impl HttpZipFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchiveFetcher for HttpZipFetcher {
    async fn fetch_into(&self, url: &str, dest: &Path) -> Result<Vec<String>, MosaicError> {
        let download_failed =
            |e: reqwest::Error| MosaicError::Io(std::io::Error::other(format!("cannot download {url}: {e}")));

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(download_failed)?;

        tokio::fs::create_dir_all(dest).await?;
        let mut spool = tokio::fs::File::from_std(tempfile::tempfile_in(dest)?);
        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(download_failed)? {
            spool.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        spool.flush().await?;
        debug!(url, size, "image archive downloaded");

        let mut spool = spool.into_std().await;
        let dest = dest.to_path_buf();
        let names = tokio::task::spawn_blocking(move || -> Result<Vec<String>, MosaicError> {
            spool.seek(SeekFrom::Start(0))?;
            extract_images(spool, &dest)
        })
        .await
        .map_err(|e| MosaicError::Io(std::io::Error::other(e)))??;
        info!(url, images = names.len(), "image archive expanded");
        Ok(names)
    }
}

/// Extract every image entry of the zip archive in `reader` into `dest`,
/// flattened to base names. Directory structure and non-image entries are
/// ignored; a repeated base name keeps the first entry.
pub fn extract_images<R: Read + Seek>(reader: R, dest: &Path) -> Result<Vec<String>, MosaicError> {
    let mut archive = zip::ZipArchive::new(reader)?;
    std::fs::create_dir_all(dest)?;

    let mut names: Vec<String> = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(path) = entry.enclosed_name() else {
            continue;
        };
        let Some(base) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if !is_image_file_name(&base) || names.contains(&base) {
            continue;
        }
        let mut file = std::fs::File::create(dest.join(&base))?;
        std::io::copy(&mut entry, &mut file)?;
        names.push(base);
    }
    Ok(names)
}
