//! Nightly export of a portal folder to S3-compatible object storage.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use chrono::NaiveDate;
use tracing::{debug, info, instrument};

use crate::arcgis::model::PortalItem;
use crate::arcgis::{ItemData, PortalContent};
use crate::config;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;
}

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub fn new(cfg: &config::ObjectStore) -> Self {
        let credentials = Credentials::new(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            None,
            None,
            "environment",
        );
        let conf = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .endpoint_url(cfg.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, body))]
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("failed to upload {}/{}", self.bucket, key))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub items: usize,
    pub uploaded: Vec<String>,
    pub skipped: usize,
}

/// `<folder>/bkup_<DDMMYYYY>/<file>`
pub fn object_key(folder: &str, day: NaiveDate, file_name: &str) -> String {
    format!(
        "{}/bkup_{}/{}",
        folder.trim_end_matches('/'),
        day.format("%d%m%Y"),
        file_name
    )
}

fn file_name_for(item: &PortalItem) -> String {
    item.name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| n.replace('/', "_"))
        .unwrap_or_else(|| format!("item_{}", item.id))
}

/// Upload every item of `folder_title`; the first failure aborts the job.
pub async fn run_backup(
    portal: &dyn PortalContent,
    store: &dyn ObjectStore,
    folder_title: &str,
    object_folder: &str,
    day: NaiveDate,
) -> Result<BackupSummary> {
    let items = portal.folder_items(folder_title).await?;
    let mut summary = BackupSummary {
        items: items.len(),
        ..Default::default()
    };

    for item in &items {
        debug!(name = ?item.name, title = %item.title, "backup item");
        let (file_name, body, content_type) = match portal.item_data(item).await? {
            ItemData::Json(value) => (
                format!("item_{}.json", item.id),
                serde_json::to_vec(&value)?,
                "application/json",
            ),
            ItemData::File(bytes) => (file_name_for(item), bytes, "application/octet-stream"),
            ItemData::Empty => {
                debug!(item = %item.id, "item has no data");
                summary.skipped += 1;
                continue;
            }
        };
        let key = object_key(object_folder, day, &file_name);
        debug!(%key, "upload backup to storage");
        store.put_object(&key, body, content_type).await?;
        summary.uploaded.push(key);
    }

    info!(
        items = summary.items,
        uploaded = summary.uploaded.len(),
        skipped = summary.skipped,
        "backup complete"
    );
    Ok(summary)
}
