//! Delta notifier: confirmation emails for new service requests and
//! follow-ups once a coordinator is assigned.
//!
//! A run reads the last marker, fetches requests whose `Date_Requested`
//! falls in `[marker, run start]`, emails each one not yet tracked, checks
//! tracked requests for a newly assigned lead, and appends a new marker.
//! Rows are only written after the matching email was accepted by the relay.

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde_json::{json, Value};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::arcgis::RecordSource;
use crate::config::{Notify, RedeliveryPolicy};
use crate::db::{self, Pool};
use crate::mail::{Email, Mailer};
use crate::model::{
    CandidateRecord, Window, F_PROJECT_LEAD, F_PROJECT_LEAD_EMAIL, F_RESOURCE_EMAIL,
    F_RESOURCE_NAME, REQUIRED_FIELDS,
};
use crate::template::{self, Templates};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("record source is missing required fields: {0:?}")]
    MissingFields(Vec<String>),
}

/// External collaborators of a run.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub db: &'a Pool,
    pub source: &'a dyn RecordSource,
    pub mailer: &'a dyn Mailer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifySummary {
    pub fetched: usize,
    pub notified: usize,
    pub already_processed: usize,
    pub missing_id: usize,
    pub not_allowed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowUpSummary {
    pub unassigned: usize,
    pub matched: usize,
    pub notified: usize,
    pub failed: usize,
    /// Sent, but the tracked row was gone when the lead was stored.
    pub untracked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub window: Window,
    pub notify: NotifySummary,
    pub follow_up: FollowUpSummary,
    pub marker: DateTime<Utc>,
}

pub struct Notifier<'a> {
    ctx: RunContext<'a>,
    settings: &'a Notify,
    templates: &'a Templates,
}

impl<'a> Notifier<'a> {
    pub fn new(ctx: RunContext<'a>, settings: &'a Notify, templates: &'a Templates) -> Self {
        Self {
            ctx,
            settings,
            templates,
        }
    }

    /// One complete pass. `this_run` is the window's upper bound, captured
    /// once at process start.
    pub async fn run(&self, this_run: DateTime<Utc>) -> Result<RunSummary> {
        let window = self.window(this_run).await?;
        info!(lower = %window.lower, upper = %window.upper, "processing window");

        let records = self.fetch_delta(&window).await?;
        let notify = self.notify_new_requests(records).await?;
        let follow_up = self.manage_resource_changes().await?;
        let marker = self.advance_marker(&window, &notify).await?;

        Ok(RunSummary {
            window,
            notify,
            follow_up,
            marker,
        })
    }

    pub async fn window(&self, this_run: DateTime<Utc>) -> Result<Window> {
        let lower = db::last_run_marker(self.ctx.db)
            .await?
            .unwrap_or(self.settings.initial_marker);
        Ok(Window {
            lower,
            upper: this_run,
        })
    }

    /// Candidates in the window, sorted by request id.
    #[instrument(skip_all)]
    pub async fn fetch_delta(&self, window: &Window) -> Result<Vec<CandidateRecord>> {
        let fields = self.ctx.source.field_names().await?;
        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|f| !fields.iter().any(|have| have == *f))
            .map(|f| f.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(NotifyError::MissingFields(missing).into());
        }

        let mut records = self.ctx.source.query_window(window).await?;
        records.sort_by(|a, b| a.request_id().cmp(&b.request_id()));
        debug!(count = records.len(), "found requests requiring email");
        Ok(records)
    }

    #[instrument(skip_all)]
    pub async fn notify_new_requests(&self, records: Vec<CandidateRecord>) -> Result<NotifySummary> {
        let mut summary = NotifySummary {
            fetched: records.len(),
            ..Default::default()
        };

        for mut record in records {
            let Some(request_id) = record.request_id().map(str::to_string) else {
                info!(object_id = ?record.object_id(), "no project number for request");
                summary.missing_id += 1;
                continue;
            };
            if !db::request_is_new(self.ctx.db, &request_id).await? {
                debug!(%request_id, "already notified");
                summary.already_processed += 1;
                continue;
            }

            record.normalize_dates();

            let Some(mut to) = self.confirmation_recipients(&record) else {
                info!(
                    %request_id,
                    email = record.client_email().unwrap_or_default(),
                    "no confirmation sent: email not in an allowed domain"
                );
                summary.not_allowed += 1;
                continue;
            };
            if record.is_urgent() {
                info!(%request_id, "urgent request");
                if let Some(urgent) = &self.settings.urgent_email {
                    to.extend(crate::config::split_list(urgent));
                }
            }

            let html = self.render(template::CONFIRMATION, &record)?;
            let email = Email {
                from: self.settings.from_email.clone(),
                to,
                subject: self.subject("Geospatial Service Request", &request_id),
                html_body: html,
            };
            info!(%request_id, to = %email.to.join(";"), "sending confirmation");

            if self.dispatch(&email).await {
                db::add_new_request(
                    self.ctx.db,
                    &request_id,
                    Utc::now(),
                    record.text(F_PROJECT_LEAD),
                    record.text(F_PROJECT_LEAD_EMAIL),
                )
                .await?;
                summary.notified += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            fetched = summary.fetched,
            notified = summary.notified,
            failed = summary.failed,
            "confirmation pass complete"
        );
        Ok(summary)
    }

    /// Follow-up emails for tracked requests that now have a coordinator.
    #[instrument(skip_all)]
    pub async fn manage_resource_changes(&self) -> Result<FollowUpSummary> {
        debug!("checking for resource changes");
        let unassigned = db::unassigned_request_ids(self.ctx.db).await?;
        let mut summary = FollowUpSummary {
            unassigned: unassigned.len(),
            ..Default::default()
        };
        if unassigned.is_empty() {
            return Ok(summary);
        }
        debug!(count = unassigned.len(), "requests with unassigned lead");

        let pending: HashSet<&str> = unassigned.iter().map(String::as_str).collect();
        let matches = self.ctx.source.query_assigned_leads(&unassigned).await?;
        if matches.is_empty() {
            debug!("no new project lead assignments");
        }

        let mut handled: HashSet<String> = HashSet::new();
        for mut record in matches {
            let Some(request_id) = record.request_id().map(str::to_string) else {
                continue;
            };
            // One follow-up per request, even if several coordinators match.
            if !pending.contains(request_id.as_str()) || !handled.insert(request_id.clone()) {
                continue;
            }
            let Some(lead_name) = record.text(F_RESOURCE_NAME).map(str::to_string) else {
                continue;
            };
            summary.matched += 1;

            let to = match &self.settings.test_email {
                Some(test) => crate::config::split_list(test),
                None => record.client_email().map(|e| vec![e.to_string()]).unwrap_or_default(),
            };
            if to.is_empty() {
                warn!(%request_id, "no recipient for lead assignment update");
                continue;
            }

            record.normalize_dates();
            let html = self.render(template::ASSIGNMENT, &record)?;
            let email = Email {
                from: self.settings.from_email.clone(),
                to,
                subject: self.subject("Geospatial Service Request Update", &request_id),
                html_body: html,
            };
            info!(%request_id, to = %email.to.join(";"), "sending request leader update");

            if !self.dispatch(&email).await {
                summary.failed += 1;
            } else if db::assign_lead(
                self.ctx.db,
                &request_id,
                &lead_name,
                record.text(F_RESOURCE_EMAIL),
            )
            .await?
            {
                summary.notified += 1;
            } else {
                warn!(%request_id, lead = %lead_name, "update sent but request is no longer tracked");
                summary.untracked += 1;
            }
        }
        Ok(summary)
    }

    /// Append the next marker. Under `at-least-once`, a run with failed
    /// confirmations keeps the current lower bound.
    pub async fn advance_marker(&self, window: &Window, notify: &NotifySummary) -> Result<DateTime<Utc>> {
        let marker = match self.settings.redelivery {
            RedeliveryPolicy::AtLeastOnce if notify.failed > 0 => {
                warn!(
                    policy = self.settings.redelivery.as_str(),
                    failed = notify.failed,
                    lower = %window.lower,
                    "confirmation sends failed; window will be fetched again"
                );
                window.lower
            }
            _ => Utc::now(),
        };
        db::record_run_marker(self.ctx.db, marker).await?;
        Ok(marker)
    }

    /// `None` when the request must not be emailed.
    pub fn confirmation_recipients(&self, record: &CandidateRecord) -> Option<Vec<String>> {
        if let Some(test) = &self.settings.test_email {
            return Some(crate::config::split_list(test));
        }
        let email = record.client_email()?;
        is_allowed_domain(email, &self.settings.allowed_domains).then(|| vec![email.to_string()])
    }

    fn subject(&self, prefix: &str, request_id: &str) -> String {
        let test = if self.settings.test_email.is_some() {
            "[TEST] "
        } else {
            ""
        };
        format!("{test}{prefix} [{request_id}]")
    }

    fn render(&self, name: &str, record: &CandidateRecord) -> Result<String> {
        let mut request = record.attributes.clone();
        let link = &self.settings.link;
        for (key, value) in [
            ("CLIENT_AGO_ACCOUNT", &link.ago_account),
            ("CLIENT_AGO_SECRET", &link.ago_secret),
            ("CLIENT_REQUEST_URL", &link.request_url),
        ] {
            request.insert(key.to_string(), json!(value));
        }
        let url = deep_link(self.settings, record);
        self.templates
            .render(name, &json!({ "request": Value::Object(request), "url": url }))
    }

    async fn dispatch(&self, email: &Email) -> bool {
        match self.ctx.mailer.send(email).await {
            Ok(()) => {
                debug!(to = %email.to.join(";"), "email sent");
                true
            }
            Err(err) => {
                error!(?err, subject = %email.subject, "error sending email");
                false
            }
        }
    }
}

pub fn is_allowed_domain(email: &str, domains: &[String]) -> bool {
    let email = email.trim().to_ascii_lowercase();
    domains
        .iter()
        .any(|d| email.ends_with(&format!("@{}", d.trim().trim_start_matches('@').to_ascii_lowercase())))
}

/// Link into the client portal filtered to the requester and this request.
pub fn deep_link(settings: &Notify, record: &CandidateRecord) -> Option<String> {
    let link = &settings.link;
    let root = link.url_root.as_deref()?;
    let ds = link.experience_ds.as_deref()?;
    let mut url = Url::parse(root).ok()?;
    url.query_pairs_mut()
        .append_pair(
            "data_filter",
            &format!(
                "{ds}:lower(Client_Email)='{}'",
                record.client_email().unwrap_or_default().to_ascii_lowercase()
            ),
        )
        .append_pair(
            "data_id",
            &format!("{ds}:{}", record.object_id().unwrap_or_default()),
        )
        .append_pair("org", &link.org);
    Some(url.to_string())
}
