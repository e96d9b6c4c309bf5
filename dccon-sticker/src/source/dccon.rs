//! dcinside dccon pack host.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{FetchedPack, PackAsset, PackSource};
use crate::domain::PackId;
use crate::utils::http_client;
use crate::{Error, Result};

const PACKAGE_DETAIL_URL: &str = "https://dccon.dcinside.com/index/package_detail";
const IMAGE_URL: &str = "https://dcimg5.dcinside.com/dccon.php";
const REFERER: &str = "https://dccon.dcinside.com/";

#[derive(Debug, Deserialize)]
struct PackageDetail {
    info: PackageInfo,
    #[serde(default)]
    detail: Vec<DetailEntry>,
}

#[derive(Debug, Deserialize)]
struct PackageInfo {
    title: String,
}

#[derive(Debug, Deserialize)]
struct DetailEntry {
    path: String,
    ext: String,
}

/// Fetches dccon packs from dcinside.
pub struct DcconSource {
    client: Client,
    detail_url: String,
    image_url: String,
}

impl DcconSource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client::build_client(Duration::from_secs(60))?,
            detail_url: PACKAGE_DETAIL_URL.to_string(),
            image_url: IMAGE_URL.to_string(),
        })
    }

    async fn fetch_detail(&self, pack_id: PackId) -> Result<PackageDetail> {
        let response = self
            .client
            .post(&self.detail_url)
            .header("X-Requested-With", "XMLHttpRequest")
            .form(&[("package_idx", pack_id.to_string())])
            .send()
            .await?
            .error_for_status()?;

        // Served as text/html, so decode the body manually.
        let body = response.text().await?;
        parse_package_detail(&body)
            .map_err(|e| Error::fetch(pack_id.0, format!("invalid package detail: {e}")))
    }

    /// Download one asset. Failures are logged and leave no file behind.
    async fn download(&self, pack_id: PackId, remote_path: &str, dest: &Path) {
        let result = self
            .client
            .get(&self.image_url)
            .query(&[("no", remote_path)])
            .header(reqwest::header::REFERER, REFERER)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(%pack_id, path = %dest.display(), error = %e, "Image download failed");
                return;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            warn!(%pack_id, path = %dest.display(), status = %response.status(), "Image download failed");
            return;
        }

        match response.bytes().await {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(dest, &bytes).await {
                    warn!(%pack_id, path = %dest.display(), error = %e, "Failed to write image");
                }
            }
            Err(e) => warn!(%pack_id, path = %dest.display(), error = %e, "Image body read failed"),
        }
    }
}

#[async_trait]
impl PackSource for DcconSource {
    async fn fetch_pack(&self, pack_id: PackId, dest_dir: &Path) -> Result<FetchedPack> {
        let detail = self.fetch_detail(pack_id).await?;
        debug!(%pack_id, title = %detail.info.title, count = detail.detail.len(), "Fetched package detail");

        let assets = assets_for(&detail, dest_dir);
        let downloads = detail
            .detail
            .iter()
            .zip(&assets)
            .map(|(entry, asset)| self.download(pack_id, &entry.path, &asset.source_path));
        join_all(downloads).await;

        Ok(FetchedPack {
            pack_id,
            title: detail.info.title,
            assets,
        })
    }
}

fn parse_package_detail(body: &str) -> serde_json::Result<PackageDetail> {
    serde_json::from_str(body)
}

fn assets_for(detail: &PackageDetail, dest_dir: &Path) -> Vec<PackAsset> {
    detail
        .detail
        .iter()
        .zip(1u32..)
        .map(|(entry, ordinal)| {
            let ext = entry.ext.to_ascii_lowercase();
            PackAsset {
                ordinal,
                source_path: dest_dir.join(format!("{ordinal}.{ext}")),
                declared_ext: ext,
            }
        })
        .collect()
}
