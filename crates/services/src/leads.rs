//! # Lead Submission Dispatcher
//!
//! Posts an accepted lead to the advertiser's endpoint and records the
//! attempt. Delivery is decided by a case-insensitive search for the SOI's
//! success string in the response body.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use domains::errors::{DomainError, Result};
use domains::models::{
    HttpMethod, LeadStatus, NewLead, Offer, OfferRef, PostingConfig, PostingData, PostingMethod,
    VisitorData,
};
use domains::ports::{Clock, EventStore, HttpClient, OfferRepository, OutboundRequest, RequestBody};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::sessions::SessionService;

const DATE_FIELD: &str = "Date";
const IP_FIELD: &str = "IP Address";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadSubmission {
    pub soi_id: i64,
    #[serde(default)]
    pub path_id: Option<i64>,
    #[serde(default)]
    pub question_id: Option<i64>,
    #[serde(default)]
    pub answer_id: Option<i64>,
    #[serde(default)]
    pub posting_data: PostingData,
    #[serde(default)]
    pub user_data: VisitorData,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(skip)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeadOutcome {
    pub lead_id: i64,
    pub status: LeadStatus,
    pub delivered: bool,
}

pub struct LeadDispatcher {
    offers: Arc<dyn OfferRepository>,
    events: Arc<dyn EventStore>,
    http: Arc<dyn HttpClient>,
    sessions: Arc<SessionService>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl LeadDispatcher {
    pub fn new(
        offers: Arc<dyn OfferRepository>,
        events: Arc<dyn EventStore>,
        http: Arc<dyn HttpClient>,
        sessions: Arc<SessionService>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            offers,
            events,
            http,
            sessions,
            clock,
            timeout,
        }
    }

    /// Sends the lead, records it whatever happened, and credits the session
    /// when the advertiser accepted it.
    pub async fn submit(
        &self,
        session_id: &str,
        submission: LeadSubmission,
    ) -> Result<LeadOutcome> {
        let soi = self.find_soi(submission.soi_id).await?;
        let posting = soi
            .posting
            .as_ref()
            .ok_or_else(|| {
                DomainError::Validation(format!("soi {} has no posting configuration", soi.id))
            })?;
        let now = self.clock.now();

        let data =
            build_posting_data(posting, submission.posting_data, submission.ip.as_deref(), now);
        let body = self.post(posting, &data).await;
        let delivered = is_delivered(&body, &posting.success_string);
        let status = if body.is_empty() {
            LeadStatus::Flagged
        } else if delivered {
            LeadStatus::Delivered
        } else {
            LeadStatus::Rejected
        };

        let lead = NewLead {
            soi_id: soi.id,
            soi_label: soi.admin_label.clone(),
            advertiser_id: soi.advertiser.id,
            advertiser: soi.advertiser.title.clone(),
            path_id: submission.path_id,
            cost: soi.cost,
            status,
            posting_data: data,
            platform: submission.platform,
            submission_response: body,
            question_id: submission.question_id,
            answer_id: submission.answer_id,
            traffic_source: submission.utm_source,
            visitor: submission.user_data,
            ip: submission.ip,
            created_at: now,
        };
        let lead_id = self.events.record_lead(&lead).await?;
        info!(lead_id, soi = soi.id, %status, "lead recorded");

        if delivered {
            self.sessions.credit_soi(session_id, soi.cost).await?;
        }

        Ok(LeadOutcome {
            lead_id,
            status,
            delivered,
        })
    }

    /// Replays a stored lead's posting data. Never credits revenue.
    pub async fn resubmit(&self, lead_id: i64) -> Result<LeadOutcome> {
        let lead = self
            .events
            .find_lead(lead_id)
            .await?
            .ok_or_else(|| DomainError::not_found("lead", lead_id))?;
        let soi = self.find_soi(lead.record.soi_id).await?;
        let posting = soi
            .posting
            .as_ref()
            .ok_or_else(|| {
                DomainError::Validation(format!("soi {} has no posting configuration", soi.id))
            })?;

        let body = self.post(posting, &lead.record.posting_data).await;
        let delivered = is_delivered(&body, &posting.success_string);
        let status = if delivered {
            LeadStatus::Delivered
        } else {
            LeadStatus::Rejected
        };

        self.events.update_lead_submission(lead_id, status, &body).await?;
        info!(lead_id, %status, "lead resubmitted");

        Ok(LeadOutcome {
            lead_id,
            status,
            delivered,
        })
    }

    async fn find_soi(&self, id: i64) -> Result<Offer> {
        self.offers
            .find_offer(OfferRef::soi(id))
            .await?
            .ok_or_else(|| DomainError::not_found("soi", id))
    }

    /// Response body, or an empty string when the request never completed.
    async fn post(&self, posting: &PostingConfig, data: &PostingData) -> String {
        let request = build_request(posting, data, self.timeout);
        match self.http.execute(request).await {
            Ok(response) => response.body,
            Err(e) => {
                warn!(url = %posting.url, error = %e, "lead posting failed");
                String::new()
            }
        }
    }
}

fn is_delivered(body: &str, success_string: &str) -> bool {
    !body.is_empty() && body.to_lowercase().contains(&success_string.to_lowercase())
}

/// Caller data, then server-generated posting fields, then hardcoded fields.
pub fn build_posting_data(
    posting: &PostingConfig,
    mut data: PostingData,
    ip: Option<&str>,
    now: NaiveDateTime,
) -> PostingData {
    for field in posting.posting_fields.iter().filter(|f| f.enabled) {
        let Some(client_field) = field.client_field.as_deref().filter(|c| !c.is_empty()) else {
            continue;
        };
        match field.field.as_str() {
            DATE_FIELD => {
                if let Some(format) = field.format.as_deref().filter(|f| !f.is_empty()) {
                    data.insert(client_field.to_string(), Value::String(format_date(now, format)));
                }
            }
            IP_FIELD => {
                let ip = ip.unwrap_or_default().to_string();
                data.insert(client_field.to_string(), Value::String(ip));
            }
            _ => {}
        }
    }

    for hardcoded in &posting.hardcoded_fields {
        data.insert(hardcoded.field.clone(), Value::String(hardcoded.value.clone()));
    }
    data
}

fn build_request(
    posting: &PostingConfig,
    data: &PostingData,
    timeout: Duration,
) -> OutboundRequest {
    let headers: Vec<(String, String)> = posting
        .custom_headers
        .iter()
        .filter(|h| !h.name.is_empty() && !h.value.is_empty())
        .map(|h| (h.name.clone(), h.value.clone()))
        .collect();
    let json = headers
        .iter()
        .any(|(name, value)| name == "Content-Type" && value == "application/json");

    let (method, body) = match posting.method {
        PostingMethod::HttpPost if json => {
            (HttpMethod::Post, RequestBody::Json(Value::Object(data.clone())))
        }
        PostingMethod::HttpPost => (HttpMethod::Post, RequestBody::Form(flatten(data))),
        PostingMethod::HttpGet => (HttpMethod::Get, RequestBody::Query(flatten(data))),
    };

    OutboundRequest {
        method,
        url: posting.url.clone(),
        body,
        headers,
        timeout,
    }
}

fn flatten(data: &PostingData) -> Vec<(String, String)> {
    data.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

/// Formats with a PHP `date()` pattern, the notation stored for posting fields.
pub fn format_date(now: NaiveDateTime, php_format: &str) -> String {
    let pattern = php_to_strftime(php_format);
    let mut out = String::new();
    if write!(out, "{}", now.format(&pattern)).is_err() {
        warn!(format = php_format, "unsupported date format");
        return now.format("%Y-%m-%d %H:%M:%S").to_string();
    }
    out
}

fn php_to_strftime(php: &str) -> String {
    let mut out = String::with_capacity(php.len() * 2);
    let mut chars = php.chars();
    while let Some(c) = chars.next() {
        let mapped = match c {
            'd' => "%d",
            'D' => "%a",
            'j' => "%-d",
            'l' => "%A",
            'N' => "%u",
            'm' => "%m",
            'M' => "%b",
            'n' => "%-m",
            'F' => "%B",
            'Y' => "%Y",
            'y' => "%y",
            'H' => "%H",
            'G' => "%-H",
            'h' => "%I",
            'g' => "%-I",
            'i' => "%M",
            's' => "%S",
            'A' => "%p",
            'a' => "%P",
            'U' => "%s",
            '\\' => {
                if let Some(escaped) = chars.next() {
                    push_literal(&mut out, escaped);
                }
                continue;
            }
            other => {
                push_literal(&mut out, other);
                continue;
            }
        };
        out.push_str(mapped);
    }
    out
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}
