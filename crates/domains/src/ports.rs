//! # Ports
//!
//! Collaborators the engine consumes. Adapters in other crates implement
//! these; services only ever see the traits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::errors::{Result, TransportError};
use crate::models::{
    Conversion, HttpMethod, Lead, LeadStatus, NewLead, Offer, OfferRef, PathOffers, Pixel,
    SessionContext, Skip, StoredConversion,
};

/// Read access to offer configuration.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait OfferRepository: Send + Sync {
    /// Path with its SOI groups and linkouts, each in display order.
    async fn path_offers(&self, path_id: i64) -> Result<Option<PathOffers>>;

    async fn find_offer(&self, offer: OfferRef) -> Result<Option<Offer>>;
}

/// Counts historical delivered/shown events for cap enforcement.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CapCounter: Send + Sync {
    /// Events for `offer` at or after `since`; all time when `since` is `None`.
    async fn count_events(&self, offer: OfferRef, since: Option<NaiveDateTime>) -> Result<u64>;
}

/// Cached third-party email verification results.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait VerificationCache: Send + Sync {
    async fn email_verified(&self, email: &str) -> Result<Option<bool>>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PixelRepository: Send + Sync {
    /// Enabled pixels at a location, in listing order.
    async fn enabled_pixels(&self, location: &str, cpa_partner: bool) -> Result<Vec<Pixel>>;
}

/// Session-scoped revenue state.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns a zeroed context for unknown sessions.
    async fn load(&self, session_id: &str) -> Result<SessionContext>;

    async fn save(&self, session: &SessionContext) -> Result<()>;
}

/// Audit records plus the updates lead resubmission and CPA confirmation need.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn record_lead(&self, lead: &NewLead) -> Result<i64>;

    async fn find_lead(&self, id: i64) -> Result<Option<Lead>>;

    async fn update_lead_submission(
        &self,
        id: i64,
        status: LeadStatus,
        submission_response: &str,
    ) -> Result<()>;

    async fn record_conversion(&self, conversion: &Conversion) -> Result<i64>;

    async fn find_conversion(&self, id: i64) -> Result<Option<StoredConversion>>;

    /// Marks a conversion paid at `cost`.
    async fn complete_conversion(
        &self,
        id: i64,
        cost: f64,
        completed_at: NaiveDateTime,
    ) -> Result<()>;

    async fn record_skip(&self, skip: &Skip) -> Result<i64>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Query(Vec<(String, String)>),
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: RequestBody,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Any status code is a response; only transport failures are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(
        &self,
        request: OutboundRequest,
    ) -> std::result::Result<HttpResponse, TransportError>;
}

/// Renders pixel code against a `{ revenue, user_data }` context.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, context: &serde_json::Value) -> Result<String>;
}

/// Wall clock in the server's local time.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
