//! Upload of a finished backup to a blob container
//!
//! Every regular file under the backup root is `PUT` to the container URL
//! with its path relative to the root as the object key. The container URL
//! may carry a SAS query string, which is kept on every request.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Url};
use std::path::{Component, Path};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::UploadConfig;

/// Uploads files to one blob container
pub struct Uploader {
    client: Client,
    container: Url,
}

impl Uploader {
    pub fn new(config: &UploadConfig, insecure: bool) -> Result<Self> {
        let container = Url::parse(&config.url)
            .with_context(|| format!("Invalid upload url: {}", redact(&config.url)))?;

        if container.cannot_be_a_base() {
            bail!("Upload url {} cannot hold object paths", redact(&config.url));
        }

        let client = Client::builder()
            .user_agent(concat!("git-backup/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(insecure)
            .build()
            .context("Failed to create upload client")?;

        Ok(Self { client, container })
    }

    /// URL for the object stored under `key`.
    pub fn object_url(&self, key: &str) -> Result<Url> {
        let mut url = self.container.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Upload url cannot hold object paths"))?
            .pop_if_empty()
            .extend(key.split('/'));
        Ok(url)
    }

    /// Upload every file under `root`, stopping at the first failure.
    ///
    /// Returns the number of files uploaded.
    pub async fn upload_dir(&self, root: &Path) -> Result<usize> {
        info!("Uploading {} to {}", root.display(), redact(self.container.as_str()));

        let mut uploaded = 0;

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.context("Failed to walk the backup directory")?;
            if !entry.file_type().is_file() {
                continue;
            }

            let key = object_key(root, entry.path())?;
            self.upload_file(entry.path(), &key).await?;
            uploaded += 1;
        }

        info!("Upload complete, {} files", uploaded);
        Ok(uploaded)
    }

    async fn upload_file(&self, path: &Path, key: &str) -> Result<()> {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let length = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();

        // Streamed so pack files of any size never sit in memory whole
        let body = Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .client
            .put(self.object_url(key)?)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", key))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Upload of {} failed with {}", key, status);
        }

        debug!("Uploaded {}", key);
        Ok(())
    }
}

/// `/`-separated path of `path` relative to `root`.
fn object_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;

    let segments: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    Ok(segments.join("/"))
}

/// Drop the query string, which usually holds a SAS token.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
