use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, instrument};

use crate::config;
use crate::model::{
    CandidateRecord, Window, COORDINATOR_TYPE, F_DATE_REQUESTED, F_REQUEST_ID, F_RESOURCE_NAME,
    F_RESOURCE_TYPE,
};

pub mod model;
pub mod where_clause;

use model::{
    ApiError, FolderContentResp, ItemResp, LayerResp, PortalItem, QueryResp, ServiceResp,
    TokenResp, UserContentResp,
};
use where_clause::Where;

/// Records requested per query page; the server may cap this lower.
const PAGE_SIZE: usize = 1000;
/// Identifiers per `IN (...)` list when looking up lead assignments.
const ID_CHUNK: usize = 200;
const FOLDER_PAGE_SIZE: &str = "100";
const TOKEN_EXPIRATION_MINUTES: &str = "120";

/// Where service requests come from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Field names of the request table.
    async fn field_names(&self) -> Result<Vec<String>>;

    /// All requests whose `Date_Requested` lies in the window (inclusive).
    async fn query_window(&self, window: &Window) -> Result<Vec<CandidateRecord>>;

    /// Coordinator assignments for the given request ids.
    async fn query_assigned_leads(&self, request_ids: &[String]) -> Result<Vec<CandidateRecord>>;
}

/// Read access to the account's content, used by the backup job.
#[async_trait]
pub trait PortalContent: Send + Sync {
    async fn folder_items(&self, folder_title: &str) -> Result<Vec<PortalItem>>;

    async fn item_data(&self, item: &PortalItem) -> Result<ItemData>;
}

/// Payload behind an item's `/data` endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemData {
    Json(Value),
    File(Vec<u8>),
    Empty,
}

/// Authenticated session against an ArcGIS portal.
#[derive(Clone)]
pub struct ArcGisClient {
    http: Client,
    portal: Url,
    username: String,
    token: String,
}

impl fmt::Debug for ArcGisClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcGisClient")
            .field("portal", &self.portal)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ArcGisClient {
    /// Client without a token; call [`ArcGisClient::sign_in`] before use.
    pub fn new(portal_url: &str, username: &str) -> Result<Self> {
        let portal = Url::parse(&format!("{}/", portal_url.trim_end_matches('/')))
            .with_context(|| format!("invalid portal URL {portal_url}"))?;
        let http = Client::builder()
            .user_agent("srsmail/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            portal,
            username: username.to_string(),
            token: String::new(),
        })
    }

    pub async fn connect(portal_url: &str, username: &str, password: &str) -> Result<Self> {
        let mut client = Self::new(portal_url, username)?;
        client.sign_in(password).await?;
        Ok(client)
    }

    #[instrument(skip_all, fields(username = %self.username))]
    pub async fn sign_in(&mut self, password: &str) -> Result<()> {
        let url = self.portal.join("sharing/rest/generateToken")?;
        let form = [
            ("username", self.username.clone()),
            ("password", password.to_string()),
            ("client", "referer".to_string()),
            ("referer", self.portal.to_string()),
            ("expiration", TOKEN_EXPIRATION_MINUTES.to_string()),
            ("f", "json".to_string()),
        ];
        let resp: TokenResp = self
            .post_json(url, &form)
            .await
            .context("failed to sign in to ArcGIS")?;
        debug!(expires = ?resp.expires, "signed in");
        self.token = resp.token;
        Ok(())
    }

    /// URL of the first table of the feature service behind `item_id`.
    #[instrument(skip(self))]
    pub async fn item_table_url(&self, item_id: &str) -> Result<Url> {
        let url = self
            .portal
            .join(&format!("sharing/rest/content/items/{item_id}"))?;
        let item: ItemResp = self.get_json(url, &[]).await?;
        let service = item
            .url
            .ok_or_else(|| anyhow!("item {} has no service URL", item.id))?;
        let service = service.trim_end_matches('/').to_string();

        let resp: ServiceResp = self
            .get_json(Url::parse(&service)?, &[])
            .await
            .with_context(|| format!("failed to describe service {service}"))?;
        let table = resp
            .tables
            .first()
            .ok_or_else(|| anyhow!("service {} exposes no tables", service))?;
        debug!(table = %table.name, id = table.id, "resolved item table");
        Ok(Url::parse(&format!("{}/{}", service, table.id))?)
    }

    pub async fn layer_fields(&self, table: &Url) -> Result<Vec<String>> {
        let resp: LayerResp = self.get_json(table.clone(), &[]).await?;
        Ok(resp.fields.into_iter().map(|f| f.name).collect())
    }

    /// Run a query and follow `exceededTransferLimit` until every page is read.
    #[instrument(skip(self, table))]
    pub async fn query_all(&self, table: &Url, where_clause: &str) -> Result<Vec<CandidateRecord>> {
        let url = Url::parse(&format!("{}/query", table.as_str().trim_end_matches('/')))?;
        let mut records = Vec::new();
        loop {
            let form = [
                ("where", where_clause.to_string()),
                ("outFields", "*".to_string()),
                ("returnGeometry", "false".to_string()),
                ("resultOffset", records.len().to_string()),
                ("resultRecordCount", PAGE_SIZE.to_string()),
                ("f", "json".to_string()),
            ];
            let page: QueryResp = self
                .post_json(url.clone(), &form)
                .await
                .context("feature query failed")?;
            let fetched = page.features.len();
            records.extend(page.features);
            if !page.exceeded_transfer_limit || fetched == 0 {
                break;
            }
        }
        debug!(count = records.len(), "query complete");
        Ok(records)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, params: &[(&str, &str)]) -> Result<T> {
        let mut query: Vec<(&str, &str)> = vec![("f", "json")];
        query.extend_from_slice(params);
        if !self.token.is_empty() {
            query.push(("token", self.token.as_str()));
        }
        let res = self
            .http
            .get(url.clone())
            .query(&query)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let status = res.status();
        let body = res.text().await.context("failed to read ArcGIS response")?;
        if !status.is_success() {
            bail!("arcgis error {}: {}", status, body);
        }
        decode(&body)
    }

    async fn post_json<T: DeserializeOwned>(&self, url: Url, form: &[(&str, String)]) -> Result<T> {
        let mut form = form.to_vec();
        if !self.token.is_empty() {
            form.push(("token", self.token.clone()));
        }
        let res = self
            .http
            .post(url.clone())
            .form(&form)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let status = res.status();
        let body = res.text().await.context("failed to read ArcGIS response")?;
        if !status.is_success() {
            bail!("arcgis error {}: {}", status, body);
        }
        decode(&body)
    }
}

/// Decode a REST payload, surfacing `{"error": {...}}` bodies as errors.
fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    let value: Value = serde_json::from_str(body).context("invalid ArcGIS response JSON")?;
    if let Some(err) = value.get("error") {
        let err: ApiError = serde_json::from_value(err.clone())
            .map_err(|_| anyhow!("arcgis error: {}", err))?;
        bail!(
            "arcgis error {}: {} {}",
            err.code,
            err.message,
            err.details.join("; ")
        );
    }
    serde_json::from_value(value).context("unexpected ArcGIS response shape")
}

#[async_trait]
impl PortalContent for ArcGisClient {
    #[instrument(skip(self))]
    async fn folder_items(&self, folder_title: &str) -> Result<Vec<PortalItem>> {
        let user_url = self
            .portal
            .join(&format!("sharing/rest/content/users/{}", self.username))?;
        let content: UserContentResp = self.get_json(user_url.clone(), &[]).await?;
        let folder = content
            .folders
            .into_iter()
            .find(|f| f.title == folder_title)
            .ok_or_else(|| anyhow!("folder '{}' not found for {}", folder_title, self.username))?;

        let folder_url = self.portal.join(&format!(
            "sharing/rest/content/users/{}/{}",
            self.username, folder.id
        ))?;
        let mut items = Vec::new();
        let mut start: i64 = 1;
        loop {
            let start_param = start.to_string();
            let page: FolderContentResp = self
                .get_json(
                    folder_url.clone(),
                    &[("num", FOLDER_PAGE_SIZE), ("start", start_param.as_str())],
                )
                .await?;
            items.extend(page.items);
            if page.next_start <= 0 || page.next_start <= start {
                break;
            }
            start = page.next_start;
        }
        info!(folder = %folder_title, count = items.len(), "listed folder items");
        Ok(items)
    }

    #[instrument(skip_all, fields(item = %item.id))]
    async fn item_data(&self, item: &PortalItem) -> Result<ItemData> {
        let url = self
            .portal
            .join(&format!("sharing/rest/content/items/{}/data", item.id))?;
        let res = self
            .http
            .get(url)
            .query(&[("token", self.token.as_str())])
            .send()
            .await
            .with_context(|| format!("failed to download data for item {}", item.id))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("item {} data error {}: {}", item.id, status, body);
        }
        let is_json = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json") || ct.starts_with("text/plain"))
            .unwrap_or(false);
        let bytes = res.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(ItemData::Empty);
        }
        if is_json {
            if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                if let Some(err) = value.get("error") {
                    bail!("item {} data error: {}", item.id, err);
                }
                return Ok(ItemData::Json(value));
            }
        }
        Ok(ItemData::File(bytes.to_vec()))
    }
}

/// The request table and, optionally, the resource-assignment table.
#[derive(Debug, Clone)]
pub struct FeatureSource {
    client: ArcGisClient,
    requests: Url,
    resources: Option<Url>,
}

impl FeatureSource {
    pub fn new(client: ArcGisClient, requests: Url, resources: Option<Url>) -> Self {
        Self {
            client,
            requests,
            resources,
        }
    }

    /// Sign in and resolve the configured items to their tables.
    pub async fn connect(cfg: &config::ArcGis) -> Result<Self> {
        let client = ArcGisClient::connect(&cfg.portal_url, &cfg.username, &cfg.password).await?;
        let requests = client
            .item_table_url(&cfg.item_id)
            .await
            .context("failed to resolve request table")?;
        let resources = match &cfg.resource_item_id {
            Some(id) => Some(
                client
                    .item_table_url(id)
                    .await
                    .context("failed to resolve resource table")?,
            ),
            None => None,
        };
        Ok(Self::new(client, requests, resources))
    }
}

#[async_trait]
impl RecordSource for FeatureSource {
    async fn field_names(&self) -> Result<Vec<String>> {
        self.client.layer_fields(&self.requests).await
    }

    async fn query_window(&self, window: &Window) -> Result<Vec<CandidateRecord>> {
        let clause = Where::new()
            .between_timestamps(F_DATE_REQUESTED, window.lower, window.upper)?
            .build();
        self.client.query_all(&self.requests, &clause).await
    }

    async fn query_assigned_leads(&self, request_ids: &[String]) -> Result<Vec<CandidateRecord>> {
        let Some(table) = &self.resources else {
            info!("no resource table configured; skipping lead lookup");
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for chunk in request_ids.chunks(ID_CHUNK) {
            let clause = Where::new()
                .in_strings(F_REQUEST_ID, chunk)?
                .is_not_null(F_RESOURCE_NAME)?
                .eq_str(F_RESOURCE_TYPE, COORDINATOR_TYPE)?
                .build();
            records.extend(self.client.query_all(table, &clause).await?);
        }
        Ok(records)
    }
}
