//! Builder for feature-service `where` clauses.
//!
//! The query API has no bound parameters, so every literal goes through
//! [`quote`] and every field name must be a plain identifier.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static FIELD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid field regex"));

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WhereError {
    #[error("invalid field name '{0}'")]
    InvalidField(String),
    #[error("IN list for '{0}' is empty")]
    EmptyList(String),
}

/// SQL string literal with embedded quotes doubled.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn field(name: &str) -> Result<&str, WhereError> {
    if FIELD_NAME.is_match(name) {
        Ok(name)
    } else {
        Err(WhereError::InvalidField(name.to_string()))
    }
}

/// Conjunction of conditions.
#[derive(Debug, Default, Clone)]
pub struct Where {
    clauses: Vec<String>,
}

impl Where {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn between_timestamps(
        mut self,
        name: &str,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    ) -> Result<Self, WhereError> {
        self.clauses.push(format!(
            "{} BETWEEN TIMESTAMP '{}' AND TIMESTAMP '{}'",
            field(name)?,
            lower.format(TIMESTAMP_FORMAT),
            upper.format(TIMESTAMP_FORMAT),
        ));
        Ok(self)
    }

    pub fn in_strings<S: AsRef<str>>(mut self, name: &str, values: &[S]) -> Result<Self, WhereError> {
        if values.is_empty() {
            return Err(WhereError::EmptyList(name.to_string()));
        }
        let list = values
            .iter()
            .map(|v| quote(v.as_ref()))
            .collect::<Vec<_>>()
            .join(",");
        self.clauses.push(format!("{} IN ({})", field(name)?, list));
        Ok(self)
    }

    pub fn is_not_null(mut self, name: &str) -> Result<Self, WhereError> {
        self.clauses.push(format!("{} IS NOT NULL", field(name)?));
        Ok(self)
    }

    pub fn eq_str(mut self, name: &str, value: &str) -> Result<Self, WhereError> {
        self.clauses.push(format!("{} = {}", field(name)?, quote(value)));
        Ok(self)
    }

    pub fn build(self) -> String {
        if self.clauses.is_empty() {
            "1=1".to_string()
        } else {
            self.clauses.join(" AND ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(quote("O'Brien"), "'O''Brien'");
        assert_eq!(quote("plain"), "'plain'");
    }

    #[test]
    fn window_clause() {
        let lower = Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap();
        let upper = Utc.with_ymd_and_hms(2024, 1, 23, 6, 30, 5).unwrap();
        let clause = Where::new()
            .between_timestamps("Date_Requested", lower, upper)
            .unwrap()
            .build();
        assert_eq!(
            clause,
            "Date_Requested BETWEEN TIMESTAMP '2024-01-22 00:00:00' AND TIMESTAMP '2024-01-23 06:30:05'"
        );
    }

    #[test]
    fn lead_clause_escapes_ids() {
        let clause = Where::new()
            .in_strings("Project_Number", &["GSS-1", "GSS-'2"])
            .unwrap()
            .is_not_null("Resource_Name")
            .unwrap()
            .eq_str("Resource_Type", "Coordinator")
            .unwrap()
            .build();
        assert_eq!(
            clause,
            "Project_Number IN ('GSS-1','GSS-''2') AND Resource_Name IS NOT NULL AND Resource_Type = 'Coordinator'"
        );
    }

    #[test]
    fn rejects_bad_fields_and_empty_lists() {
        assert_eq!(
            Where::new().is_not_null("a; drop").unwrap_err(),
            WhereError::InvalidField("a; drop".into())
        );
        let empty: [&str; 0] = [];
        assert_eq!(
            Where::new().in_strings("Project_Number", &empty).unwrap_err(),
            WhereError::EmptyList("Project_Number".into())
        );
        assert_eq!(Where::new().build(), "1=1");
    }
}
