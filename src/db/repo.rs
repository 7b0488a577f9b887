use super::model::{ProcessedRequest, EMAIL_SENT};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

/// Open (creating if needed) the state database and apply the schema.
///
/// The store is single-writer: the pool holds exactly one connection.
pub async fn init_pool(db_path: &str) -> Result<Pool> {
    let path = prepare_db_path(db_path);
    let existed = path.exists();
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database {}", path.display()))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    if !existed {
        debug!(path = %path.display(), "initialising database for the first time");
    }
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Expand a leading `~/` and ensure the parent directory exists.
fn prepare_db_path(raw: &str) -> PathBuf {
    let expanded = match raw.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => raw.to_string(),
        },
        None => raw.to_string(),
    };

    let path = PathBuf::from(expanded);
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    path
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Latest run marker, or `None` when no run has completed yet.
#[instrument(skip_all)]
pub async fn last_run_marker(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let marker: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT MAX(activity_time) FROM monitor")
            .fetch_one(pool)
            .await
            .context("failed to read run marker")?;
    Ok(marker)
}

#[instrument(skip_all)]
pub async fn record_run_marker(pool: &Pool, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("INSERT INTO monitor (activity_time) VALUES (?)")
        .bind(at)
        .execute(pool)
        .await
        .context("failed to append run marker")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn request_is_new(pool: &Pool, request_id: &str) -> Result<bool> {
    let found = sqlx::query_scalar::<_, String>(
        "SELECT request_id FROM request_tracker WHERE request_id = ?",
    )
    .bind(request_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_none())
}

/// Record a successful confirmation. A row that already exists is left alone.
#[instrument(skip_all)]
pub async fn add_new_request(
    pool: &Pool,
    request_id: &str,
    email_timestamp: DateTime<Utc>,
    lead_name: Option<&str>,
    lead_email: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO request_tracker (request_id, email_ind, email_timestamp, lead_resource, lead_email) \
         VALUES (?, ?, ?, ?, ?) ON CONFLICT(request_id) DO NOTHING",
    )
    .bind(request_id)
    .bind(EMAIL_SENT)
    .bind(email_timestamp)
    .bind(lead_name)
    .bind(lead_email)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record request {request_id}"))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn unassigned_request_ids(pool: &Pool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT request_id FROM request_tracker WHERE lead_resource IS NULL ORDER BY request_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Set the lead fields of a tracked request; returns whether a row changed.
#[instrument(skip_all)]
pub async fn assign_lead(
    pool: &Pool,
    request_id: &str,
    lead_name: &str,
    lead_email: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE request_tracker SET lead_resource = ?, lead_email = ? WHERE request_id = ?",
    )
    .bind(lead_name)
    .bind(lead_email)
    .bind(request_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to assign lead for {request_id}"))?;
    Ok(res.rows_affected() > 0)
}

pub async fn get_processed_request(
    pool: &Pool,
    request_id: &str,
) -> Result<Option<ProcessedRequest>> {
    let row = sqlx::query_as::<_, ProcessedRequest>(
        "SELECT request_id, email_ind, email_timestamp, lead_resource, lead_email \
         FROM request_tracker WHERE request_id = ?",
    )
    .bind(request_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn count_processed_requests(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_tracker")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn setup_pool() -> (TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("srsmail.db");
        let pool = init_pool(path.to_str().unwrap()).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn init_creates_file_and_schema() {
        let (dir, pool) = setup_pool().await;
        assert!(dir.path().join("state").join("srsmail.db").exists());
        assert_eq!(count_processed_requests(&pool).await.unwrap(), 0);
        assert!(last_run_marker(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_marker_reads_max() {
        let (_dir, pool) = setup_pool().await;
        let early = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 2, 8, 0, 0).unwrap();
        record_run_marker(&pool, late).await.unwrap();
        record_run_marker(&pool, early).await.unwrap();
        assert_eq!(last_run_marker(&pool).await.unwrap(), Some(late));
    }

    #[tokio::test]
    async fn request_tracking_and_lead_assignment() {
        let (_dir, pool) = setup_pool().await;
        let now = Utc::now();

        assert!(request_is_new(&pool, "GSS-1").await.unwrap());
        add_new_request(&pool, "GSS-1", now, None, None).await.unwrap();
        add_new_request(&pool, "GSS-2", now, Some("Pat Lead"), Some("pat@gov.bc.ca"))
            .await
            .unwrap();
        assert!(!request_is_new(&pool, "GSS-1").await.unwrap());

        // A second insert for the same id is ignored.
        add_new_request(&pool, "GSS-1", now, Some("Other"), None).await.unwrap();
        assert_eq!(count_processed_requests(&pool).await.unwrap(), 2);

        assert_eq!(unassigned_request_ids(&pool).await.unwrap(), vec!["GSS-1".to_string()]);

        assert!(assign_lead(&pool, "GSS-1", "Sam Coordinator", Some("sam@gov.bc.ca"))
            .await
            .unwrap());
        assert!(unassigned_request_ids(&pool).await.unwrap().is_empty());

        let row = get_processed_request(&pool, "GSS-1").await.unwrap().unwrap();
        assert_eq!(row.email_ind.as_deref(), Some(EMAIL_SENT));
        assert_eq!(row.lead_resource.as_deref(), Some("Sam Coordinator"));
        assert_eq!(row.lead_email.as_deref(), Some("sam@gov.bc.ca"));
    }

    #[tokio::test]
    async fn ids_with_quotes_are_bound_not_spliced() {
        let (_dir, pool) = setup_pool().await;
        let id = "GSS-'; DROP TABLE monitor; --";
        add_new_request(&pool, id, Utc::now(), None, None).await.unwrap();
        assert!(!request_is_new(&pool, id).await.unwrap());
        assert!(assign_lead(&pool, id, "O'Brien", None).await.unwrap());
        assert!(last_run_marker(&pool).await.unwrap().is_none());
    }
}
