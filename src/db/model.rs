//! Database entity models used by repositories.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A request that already received its confirmation email.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ProcessedRequest {
    pub request_id: String,
    pub email_ind: Option<String>,
    pub email_timestamp: Option<DateTime<Utc>>,
    pub lead_resource: Option<String>,
    pub lead_email: Option<String>,
}

/// Value stored in `email_ind` once a confirmation went out.
pub const EMAIL_SENT: &str = "y";
