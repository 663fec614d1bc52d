//! ArchiveFetcher port - リモートの画像アーカイブを staging 領域に展開

use std::path::Path;

use async_trait::async_trait;

use crate::domain::MosaicError;

/// ArchiveFetcher は `zip_url` を取得して画像を `dest` に展開する
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    /// Returns the extracted image file names (relative to `dest`) in archive order.
    async fn fetch_into(&self, url: &str, dest: &Path) -> Result<Vec<String>, MosaicError>;
}
