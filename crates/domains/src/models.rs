//! # Domain Models
//!
//! Offers (SOIs and linkouts), the rules attached to them, pixels, and the
//! visitor/session state the engine evaluates against.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Which monetizable entity an offer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferKind {
    /// Simple Opt-In: a lead form posted to the advertiser.
    Soi,
    /// Redirect offer monetized per click or per action.
    Linkout,
}

impl OfferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferKind::Soi => "soi",
            OfferKind::Linkout => "linkout",
        }
    }
}

/// Typed reference to an offer. SOI and linkout ids live in separate tables,
/// so the kind is part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OfferRef {
    pub kind: OfferKind,
    pub id: i64,
}

impl OfferRef {
    pub fn soi(id: i64) -> Self {
        Self { kind: OfferKind::Soi, id }
    }

    pub fn linkout(id: i64) -> Self {
        Self { kind: OfferKind::Linkout, id }
    }
}

impl fmt::Display for OfferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// How a linkout is paid out. SOIs are always paid per delivered lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutType {
    #[default]
    Cpc,
    Cpa,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AdvertiserRef {
    pub id: i64,
    pub title: String,
}

/// A monetizable offer with every rule attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub kind: OfferKind,
    pub enabled: bool,
    pub admin_label: String,
    pub advertiser: AdvertiserRef,
    pub cost: f64,
    #[serde(default)]
    pub payout_type: PayoutType,
    /// Lead posting target (SOIs only).
    #[serde(default)]
    pub posting: Option<PostingConfig>,
    /// Redirect target (linkouts only).
    #[serde(default)]
    pub target_url: Option<String>,
    /// Visitor fields appended to `target_url` on click.
    #[serde(default)]
    pub url_params: Vec<UrlParam>,
    /// Fixed `field=value` pairs appended after `url_params`.
    #[serde(default)]
    pub hardcoded_url_params: Vec<HardcodedField>,
    /// Token advertisers echo back on conversion postbacks (linkouts only).
    #[serde(default)]
    pub id_hash: Option<String>,
    #[serde(default)]
    pub pre_ping: Option<PrePingConfig>,
    #[serde(default)]
    pub active_times: Option<ActiveTimesCapsFilter>,
    #[serde(default)]
    pub demographic_filters: Vec<DemographicFilter>,
    #[serde(default)]
    pub blacklists: Vec<ListRule>,
    #[serde(default)]
    pub whitelists: Vec<ListRule>,
    #[serde(default)]
    pub platform: PlatformFilter,
}

impl Offer {
    pub fn offer_ref(&self) -> OfferRef {
        OfferRef { kind: self.kind, id: self.id }
    }

    /// True when an enabled pre-ping config is attached.
    pub fn requires_pre_ping(&self) -> bool {
        self.pre_ping.as_ref().is_some_and(|p| p.enabled)
    }

    /// An offer without a configured hash verifies nothing.
    pub fn verify_id_hash(&self, hash: &str) -> bool {
        self.id_hash.as_deref().is_some_and(|h| !h.is_empty() && h == hash)
    }
}

/// Active-hours window for a single weekday. Either bound may be unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActiveHours {
    pub begin: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
}

/// Weekday flags, per-weekday hours and caps. Tables are indexed Monday first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActiveTimesCapsFilter {
    pub active_days: [bool; 7],
    pub hours: [ActiveHours; 7],
    #[serde(default)]
    pub daily_cap: Option<u64>,
    #[serde(default)]
    pub total_cap: Option<u64>,
}

impl ActiveTimesCapsFilter {
    /// When no weekday is flagged the weekday gate imposes no restriction.
    pub fn restricts_weekdays(&self) -> bool {
        self.active_days.iter().any(|d| *d)
    }

    pub fn is_active_on(&self, day: Weekday) -> bool {
        self.active_days[day.num_days_from_monday() as usize]
    }

    pub fn hours_on(&self, day: Weekday) -> &ActiveHours {
        &self.hours[day.num_days_from_monday() as usize]
    }
}

/// A single `field operator value` eligibility rule, stored as entered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DemographicFilter {
    pub field: String,
    pub operator: String,
    pub value: String,
}

impl DemographicFilter {
    pub fn new(field: &str, operator: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value: value.to_string(),
        }
    }

    /// Rows with an empty field, operator or value are not enforced.
    pub fn is_blank(&self) -> bool {
        self.field.is_empty() || self.operator.is_empty() || self.value.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Has,
    HasNot,
    Between,
}

impl FilterOperator {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "eq" => Self::Eq,
            "neq" => Self::Neq,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "in" => Self::In,
            "not-in" => Self::NotIn,
            "has" => Self::Has,
            "has-not" => Self::HasNot,
            "between" => Self::Between,
            _ => return None,
        })
    }
}

/// Blacklist or whitelist entry: a field and a comma-separated value list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListRule {
    pub field: String,
    pub values: String,
}

impl ListRule {
    pub fn new(field: &str, values: &str) -> Self {
        Self {
            field: field.to_string(),
            values: values.to_string(),
        }
    }

    /// Listed values, trimmed and lower-cased.
    pub fn normalized_values(&self) -> impl Iterator<Item = String> + '_ {
        self.values.split(',').map(|v| v.trim().to_lowercase())
    }
}

/// Device targeting flags. Passed through to the client, never evaluated here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlatformFilter {
    pub active_desktop: bool,
    pub active_mobile: bool,
    pub active_ios: bool,
    pub active_android: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Outbound verification call made before an offer may be shown.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrePingConfig {
    pub enabled: bool,
    pub url: String,
    pub method: HttpMethod,
    pub success_response: String,
    /// When false the configured response is a failure marker and any other
    /// body counts as positive.
    pub positive: bool,
    #[serde(default)]
    pub url_params: Vec<UrlParam>,
}

impl PrePingConfig {
    pub fn is_positive(&self, body: &str) -> bool {
        (body == self.success_response) == self.positive
    }
}

/// Maps a visitor field (or a literal) onto an outbound query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UrlParam {
    pub field: String,
    pub client_field: String,
    #[serde(default)]
    pub format_or_value: Option<String>,
    #[serde(default)]
    pub url_encode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingMethod {
    #[default]
    HttpGet,
    HttpPost,
}

/// Where and how an SOI lead is delivered.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PostingConfig {
    pub url: String,
    pub method: PostingMethod,
    pub success_string: String,
    #[serde(default)]
    pub posting_fields: Vec<PostingField>,
    #[serde(default)]
    pub hardcoded_fields: Vec<HardcodedField>,
    #[serde(default)]
    pub custom_headers: Vec<CustomHeader>,
}

/// Server-generated posting value (`Date`, `IP Address`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostingField {
    pub field: String,
    pub client_field: Option<String>,
    pub format: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardcodedField {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CustomHeader {
    pub name: String,
    pub value: String,
}

/// A funnel. Display limits of zero or `None` mean unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Path {
    pub id: i64,
    pub slug: String,
    pub max_sois_shown_per_question: Option<u32>,
    pub max_linkouts_shown: Option<u32>,
}

/// SOIs assigned to one survey question of a path, in display order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SoiGroup {
    pub question_id: i64,
    pub offers: Vec<Offer>,
}

/// Everything a path can monetize with.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PathOffers {
    pub path: Path,
    pub soi_groups: Vec<SoiGroup>,
    pub linkouts: Vec<Offer>,
}

/// A tracking pixel definition. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pixel {
    pub id: i64,
    pub location: String,
    pub enabled: bool,
    #[serde(default)]
    pub traffic_source: String,
    #[serde(default)]
    pub all_traffic_source: bool,
    #[serde(default)]
    pub revenue_threshold: f64,
    #[serde(default)]
    pub is_cpa_partner: bool,
    #[serde(default)]
    pub cpa_value: Option<f64>,
    #[serde(default)]
    pub cpa_margin_rate: Option<f64>,
    pub code: String,
}

impl Pixel {
    /// Traffic scoping: substring of the pixel's traffic source, or all-traffic.
    /// Without a utm_content only all-traffic pixels apply.
    pub fn matches_traffic(&self, utm_content: Option<&str>) -> bool {
        match utm_content.filter(|u| !u.is_empty()) {
            Some(utm) => self.all_traffic_source || self.traffic_source.contains(utm),
            None => self.all_traffic_source,
        }
    }

    /// Revenue a CPA partner pixel consumes. `None` unless both the value and
    /// margin rate are set and non-zero.
    pub fn cpa_amount(&self) -> Option<f64> {
        match (self.cpa_value, self.cpa_margin_rate) {
            (Some(value), Some(rate)) if value != 0.0 && rate != 0.0 => Some(value * (1.0 + rate)),
            _ => None,
        }
    }
}

/// Raw visitor-submitted fields. Empty values are dropped on construction, so
/// a present key always has a non-empty value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Map<String, serde_json::Value>")]
pub struct VisitorData(BTreeMap<String, String>);

impl VisitorData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        self.0.insert(key.into(), value);
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.insert(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for VisitorData {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        use serde_json::Value;

        let mut data = VisitorData::new();
        for (key, value) in map {
            match value {
                Value::String(s) => data.insert(key, s),
                Value::Number(n) => data.insert(key, n.to_string()),
                Value::Bool(true) => data.insert(key, "1"),
                Value::Bool(false) | Value::Null => {}
                other => data.insert(key, other.to_string()),
            }
        }
        data
    }
}

impl<const N: usize> From<[(&str, &str); N]> for VisitorData {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut data = VisitorData::new();
        for (k, v) in pairs {
            data.insert(k, v);
        }
        data
    }
}

/// Session-scoped revenue state. Passed explicitly to every operation that
/// reads or credits revenue.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    /// Unconsumed attributed revenue, drawn down by CPA partner pixels.
    pub revenue_bucket: f64,
    pub soi_revenue: f64,
    pub linkout_revenue: f64,
}

impl SessionContext {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadStatus {
    Delivered,
    Rejected,
    /// No response body at all: the advertiser could not be reached.
    Flagged,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Delivered => "Delivered",
            LeadStatus::Rejected => "Rejected",
            LeadStatus::Flagged => "Flagged",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Posting payload sent to an advertiser, kept verbatim for audit and resubmission.
pub type PostingData = serde_json::Map<String, serde_json::Value>;

/// A lead submission attempt, recorded whatever its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub soi_id: i64,
    pub soi_label: String,
    pub advertiser_id: i64,
    pub advertiser: String,
    pub path_id: Option<i64>,
    pub cost: f64,
    pub status: LeadStatus,
    pub posting_data: PostingData,
    pub platform: Option<String>,
    pub submission_response: String,
    pub question_id: Option<i64>,
    pub answer_id: Option<i64>,
    pub traffic_source: Option<String>,
    pub visitor: VisitorData,
    pub ip: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    #[serde(flatten)]
    pub record: NewLead,
}

/// A linkout click.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub linkout_id: i64,
    pub payout_type: PayoutType,
    /// Zero for per-action clicks until the advertiser confirms them.
    pub cost: f64,
    /// Session credited when the conversion pays out.
    #[serde(default)]
    pub session_id: String,
    pub path_id: Option<i64>,
    pub platform: Option<String>,
    pub traffic_source: String,
    pub visitor: VisitorData,
    pub created_at: NaiveDateTime,
    /// Set when the conversion was paid: at click for CPC, on confirmation for CPA.
    #[serde(default)]
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConversion {
    pub id: i64,
    #[serde(flatten)]
    pub record: Conversion,
}

/// A visitor declining an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skip {
    pub offer: OfferRef,
    pub advertiser_id: i64,
    pub path_id: Option<i64>,
    pub visitor: VisitorData,
    pub created_at: NaiveDateTime,
}
