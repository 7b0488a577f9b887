//! Configuration loader and validator for the GSS mail and backup jobs.
//!
//! Everything comes from environment variables. `from_lookup` takes the
//! variable source as a closure so tests can feed a map instead of the
//! process environment.
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_PORTAL_URL: &str = "https://www.arcgis.com";
pub const DEFAULT_FROM_EMAIL: &str = "NoReply@geobc.ca";
pub const DEFAULT_ALLOWED_DOMAINS: &str = "gov.bc.ca";
pub const DEFAULT_URL_ORG: &str = "governmentofbc";
pub const DEFAULT_INITIAL_MARKER: &str = "2024-01-22T00:00:00Z";
pub const DEFAULT_OBJECTSTORE_REGION: &str = "us-east-1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Root configuration of the mail job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub arcgis: ArcGis,
    pub smtp: Smtp,
    pub notify: Notify,
    pub db_path: String,
}

/// Hosted GIS account and the items the jobs read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcGis {
    pub portal_url: String,
    pub username: String,
    pub password: String,
    pub item_id: String,
    pub resource_item_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smtp {
    pub host: String,
}

/// Settings that shape who gets which email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub from_email: String,
    pub test_email: Option<String>,
    pub urgent_email: Option<String>,
    pub allowed_domains: Vec<String>,
    pub template_dir: Option<String>,
    pub redelivery: RedeliveryPolicy,
    pub initial_marker: DateTime<Utc>,
    pub link: ClientLink,
}

/// Parts of the client-portal deep link plus the extras exposed to templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientLink {
    pub url_root: Option<String>,
    pub experience_ds: Option<String>,
    pub org: String,
    pub ago_account: Option<String>,
    pub ago_secret: Option<String>,
    pub request_url: Option<String>,
}

/// What happens to the time window when a confirmation send fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RedeliveryPolicy {
    /// Advance the marker to "now" regardless; failed sends are not retried.
    #[default]
    BestEffort,
    /// Keep the previous lower bound when any send failed so the window is
    /// fetched again on the next run.
    AtLeastOnce,
}

impl RedeliveryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedeliveryPolicy::BestEffort => "best-effort",
            RedeliveryPolicy::AtLeastOnce => "at-least-once",
        }
    }
}

impl FromStr for RedeliveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-effort" | "best_effort" => Ok(RedeliveryPolicy::BestEffort),
            "at-least-once" | "at_least_once" => Ok(RedeliveryPolicy::AtLeastOnce),
            other => Err(format!("unknown redelivery policy '{other}'")),
        }
    }
}

/// Root configuration of the backup job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub portal_url: String,
    pub username: String,
    pub password: String,
    pub ago_folder: String,
    pub objectstore: ObjectStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStore {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub folder: String,
}

/// Small wrapper over a variable source. Blank values count as unset.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn or_default(&self, var: &'static str, default: &str) -> String {
        self.optional(var).unwrap_or_else(|| default.to_string())
    }
}

/// Load the mail job configuration from the process environment.
pub fn from_env() -> Result<Config, ConfigError> {
    from_lookup(|k| std::env::var(k).ok())
}

/// Load the mail job configuration from an arbitrary variable source.
pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };

    let redelivery = match env.optional("REDELIVERY_POLICY") {
        Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
            var: "REDELIVERY_POLICY",
            reason,
        })?,
        None => RedeliveryPolicy::default(),
    };
    let initial_marker = parse_marker(&env.or_default("SRS_INITIAL_MARKER", DEFAULT_INITIAL_MARKER))?;

    let cfg = Config {
        arcgis: ArcGis {
            portal_url: env.or_default("SRS_PORTAL_URL", DEFAULT_PORTAL_URL),
            username: env.required("SRS_AUTH_USR")?,
            password: env.required("SRS_AUTH_PSW")?,
            item_id: env.required("SRS_ITEM")?,
            resource_item_id: env.optional("RESOURCE_ITEM"),
        },
        smtp: Smtp {
            host: env.required("SMTP_HOST")?,
        },
        notify: Notify {
            from_email: env.or_default("FROM_EMAIL", DEFAULT_FROM_EMAIL),
            test_email: env.optional("TEST_EMAIL"),
            urgent_email: env.optional("URGENT_EMAIL"),
            allowed_domains: split_list(&env.or_default("ALLOWED_EMAIL_DOMAINS", DEFAULT_ALLOWED_DOMAINS)),
            template_dir: env.optional("TEMPLATE_DIR"),
            redelivery,
            initial_marker,
            link: ClientLink {
                url_root: env.optional("CLIENT_URL_ROOT"),
                experience_ds: env.optional("CLIENT_EXPERIENCE_DS"),
                org: env.or_default("CLIENT_URL_ORG", DEFAULT_URL_ORG),
                ago_account: env.optional("CLIENT_AGO_ACCOUNT"),
                ago_secret: env.optional("CLIENT_AGO_SECRET"),
                request_url: env.optional("CLIENT_REQUEST_URL"),
            },
        },
        db_path: env.required("DB_PATH")?,
    };
    validate(&cfg)?;
    Ok(cfg)
}

/// Load the backup job configuration from the process environment.
pub fn backup_from_env() -> Result<BackupConfig, ConfigError> {
    backup_from_lookup(|k| std::env::var(k).ok())
}

pub fn backup_from_lookup<F>(lookup: F) -> Result<BackupConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };
    let endpoint = env.required("OBJECTSTORE_URL")?;
    let endpoint = if endpoint.contains("://") {
        endpoint
    } else {
        format!("https://{endpoint}")
    };
    Ok(BackupConfig {
        portal_url: env.or_default("SRS_PORTAL_URL", DEFAULT_PORTAL_URL),
        username: env.required("SRS_AUTH_USR")?,
        password: env.required("SRS_AUTH_PSW")?,
        ago_folder: env.required("AGO_FOLDER")?,
        objectstore: ObjectStore {
            endpoint,
            region: env.or_default("OBJECTSTORE_REGION", DEFAULT_OBJECTSTORE_REGION),
            bucket: env.required("OBJECTSTORE_BUCKET")?,
            access_key: env.required("OBJECTSTORE_KEY")?,
            secret_key: env.required("OBJECTSTORE_SECRET_KEY")?,
            folder: env.required("OBJECTSTORE_FOLDER")?,
        },
    })
}

fn parse_marker(raw: &str) -> Result<DateTime<Utc>, ConfigError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ConfigError::Invalid {
            var: "SRS_INITIAL_MARKER",
            reason: e.to_string(),
        })
}

/// Split a `;`- or `,`-separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if !cfg.arcgis.portal_url.starts_with("http://") && !cfg.arcgis.portal_url.starts_with("https://") {
        return Err(ConfigError::Invalid {
            var: "SRS_PORTAL_URL",
            reason: "must be an http(s) URL".into(),
        });
    }
    if cfg.notify.allowed_domains.is_empty() {
        return Err(ConfigError::Invalid {
            var: "ALLOWED_EMAIL_DOMAINS",
            reason: "must list at least one domain".into(),
        });
    }
    if !cfg.notify.from_email.contains('@') {
        return Err(ConfigError::Invalid {
            var: "FROM_EMAIL",
            reason: "must be an email address".into(),
        });
    }
    if let Some(root) = &cfg.notify.link.url_root {
        reqwest::Url::parse(root).map_err(|e| ConfigError::Invalid {
            var: "CLIENT_URL_ROOT",
            reason: e.to_string(),
        })?;
    }
    // The deep link needs both halves or neither.
    if cfg.notify.link.url_root.is_some() && cfg.notify.link.experience_ds.is_none() {
        return Err(ConfigError::Invalid {
            var: "CLIENT_EXPERIENCE_DS",
            reason: "required when CLIENT_URL_ROOT is set".into(),
        });
    }
    Ok(())
}

/// Example environment for the mail job, one `KEY=value` per line.
pub fn example() -> &'static str {
    r#"SRS_AUTH_USR=gss_service
SRS_AUTH_PSW=change-me
SRS_ITEM=0123456789abcdef0123456789abcdef
RESOURCE_ITEM=fedcba9876543210fedcba9876543210
SMTP_HOST=apps.smtp.gov.bc.ca
FROM_EMAIL=NoReply@geobc.ca
URGENT_EMAIL=gss.urgent@gov.bc.ca
CLIENT_URL_ROOT=https://experience.arcgis.com/experience/abc123
CLIENT_EXPERIENCE_DS=dataSource_1-18d2b1c6e1a-layer-2
CLIENT_REQUEST_URL=https://arcg.is/request
DB_PATH=./data/srsmail.db
"#
}

/// Parse `KEY=value` lines into a map usable with [`from_lookup`].
pub fn parse_env_lines(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}
