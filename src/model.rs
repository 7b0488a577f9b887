use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const F_REQUEST_ID: &str = "Project_Number";
pub const F_DATE_REQUESTED: &str = "Date_Requested";
pub const F_DATE_REQUIRED: &str = "Date_Required";
pub const F_PRIORITY: &str = "Priority_Level";
pub const F_CLIENT_EMAIL: &str = "Client_Email";
pub const F_OBJECT_ID: &str = "OBJECTID";
pub const F_PROJECT_LEAD: &str = "Project_Lead";
pub const F_PROJECT_LEAD_EMAIL: &str = "Project_Lead_Email";
pub const F_RESOURCE_NAME: &str = "Resource_Name";
pub const F_RESOURCE_EMAIL: &str = "Resource_Contact_Email";
pub const F_RESOURCE_TYPE: &str = "Resource_Type";

/// Fields the request table must expose for identity and windowing.
pub const REQUIRED_FIELDS: [&str; 2] = [F_REQUEST_ID, F_DATE_REQUESTED];
/// Epoch-millisecond fields rendered as calendar dates in emails.
pub const DATE_FIELDS: [&str; 2] = [F_DATE_REQUESTED, F_DATE_REQUIRED];

pub const URGENT_PRIORITY: &str = "Urgent";
pub const COORDINATOR_TYPE: &str = "Coordinator";

pub type Attributes = Map<String, Value>;

/// One row returned by the record source, in the `{"attributes": {...}}`
/// shape of a feature-service query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub attributes: Attributes,
}

impl CandidateRecord {
    pub fn new(attributes: Attributes) -> Self {
        Self { attributes }
    }

    /// Non-blank string attribute.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.attributes
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn request_id(&self) -> Option<&str> {
        self.text(F_REQUEST_ID)
    }

    pub fn client_email(&self) -> Option<&str> {
        self.text(F_CLIENT_EMAIL)
    }

    pub fn is_urgent(&self) -> bool {
        self.text(F_PRIORITY) == Some(URGENT_PRIORITY)
    }

    /// `OBJECTID` rendered for URLs; integer or string ids both occur.
    pub fn object_id(&self) -> Option<String> {
        match self.attributes.get(F_OBJECT_ID)? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    /// Replace epoch-millisecond date fields with `YYYY-MM-DD` in local time.
    /// Values that are not numbers are left as they are.
    pub fn normalize_dates(&mut self) {
        for field in DATE_FIELDS {
            let Some(millis) = self.attributes.get(field).and_then(Value::as_f64) else {
                continue;
            };
            if let Some(date) = epoch_millis_to_date(millis as i64) {
                self.attributes.insert(field.to_string(), Value::String(date));
            }
        }
    }
}

pub fn epoch_millis_to_date(millis: i64) -> Option<String> {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
}

/// Inclusive `[lower, upper]` range of `Date_Requested` covered by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub lower: DateTime<Utc>,
    pub upper: DateTime<Utc>,
}
