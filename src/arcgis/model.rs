use serde::Deserialize;

use crate::model::CandidateRecord;

/// Error body the REST API returns, usually with HTTP 200.
#[derive(Deserialize, Debug)]
pub struct ApiError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

#[derive(Deserialize, Debug)]
pub struct TokenResp {
    pub token: String,
    #[serde(default)]
    pub expires: Option<i64>,
}

#[derive(Deserialize, Debug)]
pub struct ItemResp {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ServiceTable {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Debug)]
pub struct ServiceResp {
    #[serde(default)]
    pub tables: Vec<ServiceTable>,
}

#[derive(Deserialize, Debug)]
pub struct LayerField {
    pub name: String,
}

#[derive(Deserialize, Debug)]
pub struct LayerResp {
    #[serde(default)]
    pub fields: Vec<LayerField>,
}

#[derive(Deserialize, Debug)]
pub struct QueryResp {
    #[serde(default)]
    pub features: Vec<CandidateRecord>,
    #[serde(rename = "exceededTransferLimit", default)]
    pub exceeded_transfer_limit: bool,
}

/// Content item as listed in a user's folder.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortalItem {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub typ: String,
}

#[derive(Deserialize, Debug)]
pub struct UserFolder {
    pub id: String,
    pub title: String,
}

#[derive(Deserialize, Debug)]
pub struct UserContentResp {
    #[serde(default)]
    pub folders: Vec<UserFolder>,
}

#[derive(Deserialize, Debug)]
pub struct FolderContentResp {
    #[serde(default)]
    pub items: Vec<PortalItem>,
    #[serde(rename = "nextStart", default)]
    pub next_start: i64,
}
