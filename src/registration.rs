// 🔌 Registration Service - Change registrant status through the webinar API
//
// Blocking reqwest client, no async runtime. Emails go out in batches of at
// most MAX_REGISTRANTS_PER_CALL; a failed batch is reported and the remaining
// batches still go out.

use crate::db::{insert_event, Event};
use crate::error::{AttendanceError, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{error, info};

/// Upper bound on registrants per status call
pub const MAX_REGISTRANTS_PER_CALL: usize = 30;

pub const DEFAULT_API_BASE_URL: &str = "https://api.zoom.us/v2/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusAction {
    Allow,
    Deny,
    Cancel,
}

impl StatusAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusAction::Allow => "allow",
            StatusAction::Deny => "deny",
            StatusAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for StatusAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can change the registration status of a batch of emails.
pub trait RegistrationService {
    fn set_registrant_status(
        &self,
        series_id: &str,
        action: StatusAction,
        emails: &[String],
    ) -> Result<()>;
}

// ============================================================================
// HTTP CLIENT
// ============================================================================

#[derive(Debug, Serialize)]
struct RegistrantRef<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    action: StatusAction,
    registrants: Vec<RegistrantRef<'a>>,
}

/// Webinar registration API client (blocking).
#[derive(Clone)]
pub struct ZoomRegistrationClient {
    http: reqwest::blocking::Client,
    api_base: String,
    token: String,
}

impl ZoomRegistrationClient {
    pub fn new(api_base: &str, token: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(format!("class-attendance/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;

        let mut api_base = api_base.to_string();
        if !api_base.ends_with('/') {
            api_base.push('/');
        }

        Ok(Self {
            http,
            api_base,
            token: token.to_string(),
        })
    }

    pub fn status_url(&self, series_id: &str) -> String {
        format!("{}webinars/{}/registrants/status", self.api_base, series_id)
    }
}

impl RegistrationService for ZoomRegistrationClient {
    fn set_registrant_status(
        &self,
        series_id: &str,
        action: StatusAction,
        emails: &[String],
    ) -> Result<()> {
        let body = StatusRequest {
            action,
            registrants: emails.iter().map(|email| RegistrantRef { email }).collect(),
        };

        let response = self
            .http
            .put(self.status_url(series_id))
            .bearer_auth(&self.token)
            .json(&body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AttendanceError::ServiceRejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

// ============================================================================
// BATCHING
// ============================================================================

/// Result of one status call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// 1-based position of the batch
    pub index: usize,
    pub emails: Vec<String>,
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdateReport {
    pub series_id: String,
    pub action: StatusAction,
    pub batches: Vec<BatchOutcome>,
}

impl StatusUpdateReport {
    pub fn is_clean(&self) -> bool {
        self.batches.iter().all(BatchOutcome::succeeded)
    }

    pub fn updated(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.succeeded())
            .map(|b| b.emails.len())
            .sum()
    }

    /// Failed batches as errors, in batch order
    pub fn failures(&self) -> Vec<AttendanceError> {
        self.batches
            .iter()
            .filter_map(|b| {
                b.error.as_ref().map(|message| AttendanceError::ExternalService {
                    batch: b.index,
                    emails: b.emails.clone(),
                    message: message.clone(),
                })
            })
            .collect()
    }
}

/// Apply `action` to every email, [`MAX_REGISTRANTS_PER_CALL`] at a time.
///
/// No retries; every batch is attempted exactly once.
pub fn apply_status_in_batches<S: RegistrationService + ?Sized>(
    service: &S,
    series_id: &str,
    action: StatusAction,
    emails: &[String],
) -> StatusUpdateReport {
    let mut batches = Vec::new();

    for (i, chunk) in emails.chunks(MAX_REGISTRANTS_PER_CALL).enumerate() {
        let index = i + 1;
        info!(
            "Batch {}: {} {} registrant(s) of {}",
            index,
            action,
            chunk.len(),
            series_id
        );

        let error = match service.set_registrant_status(series_id, action, chunk) {
            Ok(()) => None,
            Err(e) => {
                error!("Batch {} failed: {}", index, e);
                Some(e.to_string())
            }
        };

        batches.push(BatchOutcome {
            index,
            emails: chunk.to_vec(),
            error,
        });
    }

    StatusUpdateReport {
        series_id: series_id.to_string(),
        action,
        batches,
    }
}

/// Record one audit event per batch under the series.
pub fn record_status_events(conn: &Connection, report: &StatusUpdateReport, actor: &str) -> Result<()> {
    for batch in &report.batches {
        let event_type = if batch.succeeded() {
            "registrant_status_changed"
        } else {
            "registrant_status_failed"
        };

        let event = Event::new(
            event_type,
            "series",
            &report.series_id,
            serde_json::json!({
                "action": report.action,
                "batch": batch.index,
                "emails": batch.emails,
                "error": batch.error,
            }),
            actor,
        );
        insert_event(conn, &event)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_events_for_entity, setup_database};
    use std::cell::RefCell;

    /// Records every call; rejects the batches listed in `fail_on` (1-based)
    #[derive(Default)]
    struct FakeService {
        calls: RefCell<Vec<(String, StatusAction, Vec<String>)>>,
        fail_on: Vec<usize>,
    }

    impl RegistrationService for FakeService {
        fn set_registrant_status(
            &self,
            series_id: &str,
            action: StatusAction,
            emails: &[String],
        ) -> Result<()> {
            let mut calls = self.calls.borrow_mut();
            calls.push((series_id.to_string(), action, emails.to_vec()));
            if self.fail_on.contains(&calls.len()) {
                return Err(AttendanceError::ServiceRejected {
                    status: 429,
                    body: "too many requests".to_string(),
                });
            }
            Ok(())
        }
    }

    fn emails(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("user{:03}@example.com", i)).collect()
    }

    #[test]
    fn test_batches_never_exceed_limit() {
        let service = FakeService::default();
        let report = apply_status_in_batches(&service, "123456789", StatusAction::Cancel, &emails(65));

        let sizes: Vec<usize> = service.calls.borrow().iter().map(|(_, _, e)| e.len()).collect();
        assert_eq!(sizes, vec![30, 30, 5]);
        assert!(report.is_clean());
        assert_eq!(report.updated(), 65);
        assert!(service
            .calls
            .borrow()
            .iter()
            .all(|(id, action, _)| id == "123456789" && *action == StatusAction::Cancel));
    }

    #[test]
    fn test_failed_batch_does_not_stop_the_rest() {
        let service = FakeService {
            fail_on: vec![2],
            ..FakeService::default()
        };
        let report = apply_status_in_batches(&service, "123", StatusAction::Deny, &emails(61));

        assert_eq!(service.calls.borrow().len(), 3);
        assert!(!report.is_clean());
        assert_eq!(report.updated(), 31);

        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        match &failures[0] {
            AttendanceError::ExternalService { batch, emails, message } => {
                assert_eq!(*batch, 2);
                assert_eq!(emails.len(), 30);
                assert!(message.contains("429"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_list_makes_no_calls() {
        let service = FakeService::default();
        let report = apply_status_in_batches(&service, "123", StatusAction::Cancel, &[]);

        assert!(service.calls.borrow().is_empty());
        assert!(report.batches.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn test_request_body_shape() {
        let emails = emails(2);
        let body = StatusRequest {
            action: StatusAction::Cancel,
            registrants: emails.iter().map(|email| RegistrantRef { email }).collect(),
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "action": "cancel",
                "registrants": [
                    {"email": "user000@example.com"},
                    {"email": "user001@example.com"}
                ]
            })
        );
    }

    #[test]
    fn test_status_url() {
        let client = ZoomRegistrationClient::new("https://api.zoom.us/v2", "token").unwrap();
        assert_eq!(
            client.status_url("123456789"),
            "https://api.zoom.us/v2/webinars/123456789/registrants/status"
        );
    }

    #[test]
    fn test_status_events_recorded_per_batch() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let service = FakeService {
            fail_on: vec![1],
            ..FakeService::default()
        };
        let report = apply_status_in_batches(&service, "123", StatusAction::Cancel, &emails(31));

        record_status_events(&conn, &report, "test").unwrap();

        let events = get_events_for_entity(&conn, "series", "123").unwrap();
        assert_eq!(events.len(), 2);
        let mut types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        types.sort();
        assert_eq!(types, vec!["registrant_status_changed", "registrant_status_failed"]);
    }
}
