//! Linkout click conversions, their CPA confirmations and offer skips.

use std::sync::Arc;

use domains::errors::{DomainError, Result};
use domains::models::{Conversion, Offer, OfferRef, PayoutType, Skip, VisitorData};
use domains::ports::{Clock, EventStore, OfferRepository};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attributes::EvaluationContext;
use crate::preping;
use crate::sessions::SessionService;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClickRequest {
    pub linkout_id: i64,
    #[serde(default)]
    pub path_id: Option<i64>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub user_data: VisitorData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClickOutcome {
    pub conversion_id: i64,
    pub payout_type: PayoutType,
    /// Where the visitor is sent next.
    pub target_url: String,
}

/// Result of confirming a per-action conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct CpaCompletion {
    pub conversion_id: i64,
    pub linkout_id: i64,
    /// The linkout's cost; conversion pixels are gated on it.
    pub revenue: f64,
    /// Whether this confirmation credited the session.
    pub credited: bool,
    pub visitor: VisitorData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkipRequest {
    pub offer: OfferRef,
    #[serde(default)]
    pub path_id: Option<i64>,
    #[serde(default)]
    pub user_data: VisitorData,
}

pub struct ConversionTracker {
    offers: Arc<dyn OfferRepository>,
    events: Arc<dyn EventStore>,
    sessions: Arc<SessionService>,
    clock: Arc<dyn Clock>,
}

impl ConversionTracker {
    pub fn new(
        offers: Arc<dyn OfferRepository>,
        events: Arc<dyn EventStore>,
        sessions: Arc<SessionService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            offers,
            events,
            sessions,
            clock,
        }
    }

    /// Records the click. Per-click linkouts credit their cost to the
    /// session; per-action linkouts are paid later and record zero.
    pub async fn record_click(&self, session_id: &str, req: ClickRequest) -> Result<ClickOutcome> {
        let visitor = with_birthday(req.user_data)?;
        let linkout = self.find(OfferRef::linkout(req.linkout_id)).await?;
        let now = self.clock.now();

        let cost = match linkout.payout_type {
            PayoutType::Cpc => linkout.cost,
            PayoutType::Cpa => 0.0,
        };
        let target_url = target_url(&linkout, &EvaluationContext::new(&visitor, now));

        let conversion = Conversion {
            linkout_id: linkout.id,
            payout_type: linkout.payout_type,
            cost,
            session_id: session_id.to_string(),
            path_id: req.path_id,
            platform: req.platform,
            traffic_source: req.utm_source.unwrap_or_default(),
            visitor,
            created_at: now,
            completed_at: (linkout.payout_type == PayoutType::Cpc).then_some(now),
        };
        let conversion_id = self.events.record_conversion(&conversion).await?;
        info!(conversion_id, linkout = linkout.id, cost, "linkout click recorded");

        if linkout.payout_type == PayoutType::Cpc {
            self.sessions.credit_linkout(session_id, cost).await?;
        }

        Ok(ClickOutcome {
            conversion_id,
            payout_type: linkout.payout_type,
            target_url,
        })
    }

    /// Confirms a conversion reported by the advertiser's pixel or postback.
    ///
    /// The conversion takes the linkout's cost. A per-action conversion
    /// credits its session the first time it is confirmed; repeated
    /// confirmations only report it. A postback carries the linkout's id
    /// hash, which must match before anything is written.
    pub async fn complete_cpa(
        &self,
        session_id: &str,
        conversion_id: i64,
        id_hash: Option<&str>,
    ) -> Result<CpaCompletion> {
        let conversion = self
            .events
            .find_conversion(conversion_id)
            .await?
            .ok_or_else(|| DomainError::not_found("conversion", conversion_id))?
            .record;
        if conversion.session_id != session_id {
            return Err(DomainError::Validation(format!(
                "conversion {conversion_id} belongs to another session"
            )));
        }

        let linkout = self.find(OfferRef::linkout(conversion.linkout_id)).await?;
        if let Some(hash) = id_hash.filter(|h| !h.is_empty()) {
            if !linkout.verify_id_hash(hash) {
                return Err(DomainError::Validation(format!(
                    "linkout {} id hash does not verify",
                    linkout.id
                )));
            }
        }

        let first = conversion.completed_at.is_none();
        if first {
            self.events
                .complete_conversion(conversion_id, linkout.cost, self.clock.now())
                .await?;
        }
        let credited = first && conversion.payout_type == PayoutType::Cpa;
        if credited {
            self.sessions.credit_linkout(session_id, linkout.cost).await?;
        }
        info!(conversion_id, linkout = linkout.id, credited, "conversion confirmed");

        Ok(CpaCompletion {
            conversion_id,
            linkout_id: linkout.id,
            revenue: linkout.cost,
            credited,
            visitor: conversion.visitor,
        })
    }

    pub async fn record_skip(&self, req: SkipRequest) -> Result<i64> {
        let offer = self.find(req.offer).await?;
        let skip = Skip {
            offer: req.offer,
            advertiser_id: offer.advertiser.id,
            path_id: req.path_id,
            visitor: req.user_data,
            created_at: self.clock.now(),
        };
        self.events.record_skip(&skip).await
    }

    async fn find(&self, offer: OfferRef) -> Result<Offer> {
        self.offers
            .find_offer(offer)
            .await?
            .ok_or_else(|| DomainError::not_found(offer.kind.as_str(), offer.id))
    }
}

/// Fills `birthday` from year/month/date when it was not submitted.
fn with_birthday(mut visitor: VisitorData) -> Result<VisitorData> {
    if visitor.get("birthday").is_some() {
        return Ok(visitor);
    }
    let part = |key: &str| visitor.get(key).and_then(|v| v.trim().parse::<u32>().ok());
    let (Some(year), Some(month), Some(day)) = (part("year"), part("month"), part("date")) else {
        return Err(DomainError::Validation("birthday not specified".into()));
    };
    let birthday = chrono::NaiveDate::from_ymd_opt(year as i32, month, day)
        .ok_or_else(|| DomainError::Validation(format!("invalid birthday {year}-{month}-{day}")))?;
    visitor.insert("birthday", birthday.format("%Y-%m-%d").to_string());
    Ok(visitor)
}

/// Mapped visitor fields first, then the fixed pairs, which are sent as
/// configured.
fn target_url(linkout: &Offer, ctx: &EvaluationContext<'_>) -> String {
    let mut url = linkout.target_url.clone().unwrap_or_default();
    let mapped = linkout
        .url_params
        .iter()
        .filter(|p| !p.client_field.is_empty())
        .map(|param| {
            let text = preping::param_text(param, ctx);
            let value: String = url::form_urlencoded::byte_serialize(text.as_bytes()).collect();
            (param.client_field.as_str(), value)
        });
    let fixed = linkout
        .hardcoded_url_params
        .iter()
        .map(|p| (p.field.as_str(), p.value.clone()));

    for (i, (key, value)) in mapped.chain(fixed).enumerate() {
        let glue = if i == 0 && !url.contains('?') { '?' } else { '&' };
        url.push(glue);
        url.push_str(key);
        url.push('=');
        url.push_str(&value);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, monday_morning, offer};
    use domains::models::{HardcodedField, OfferKind, StoredConversion, UrlParam};
    use domains::ports::{FixedClock, MockEventStore, MockOfferRepository};
    use mockall::predicate::{always, eq, function};

    fn linkout(payout_type: PayoutType) -> Offer {
        let mut l = offer(OfferKind::Linkout, 5);
        l.cost = 2.0;
        l.payout_type = payout_type;
        l.target_url = Some("https://adv.example/go?ref=1".into());
        l.url_params = vec![
            UrlParam {
                field: "email".into(),
                client_field: "em".into(),
                ..Default::default()
            },
            UrlParam {
                field: "first_name".into(),
                client_field: "fn".into(),
                ..Default::default()
            },
        ];
        l
    }

    fn repo(offer: Offer) -> MockOfferRepository {
        let mut repo = MockOfferRepository::new();
        repo.expect_find_offer()
            .returning(move |r| Ok((r == offer.offer_ref()).then(|| offer.clone())));
        repo
    }

    fn click() -> ClickRequest {
        ClickRequest {
            linkout_id: 5,
            path_id: Some(1),
            utm_source: Some("fb".into()),
            user_data: VisitorData::from([
                ("email", "a@b.com"),
                ("first_name", "Ann Lee"),
                ("year", "1990"),
                ("month", "5"),
                ("date", "4"),
            ]),
            ..Default::default()
        }
    }

    fn tracker(
        repo: MockOfferRepository,
        events: MockEventStore,
        sessions: Arc<SessionService>,
    ) -> ConversionTracker {
        let clock = Arc::new(FixedClock(monday_morning()));
        ConversionTracker::new(Arc::new(repo), Arc::new(events), sessions, clock)
    }

    #[tokio::test]
    async fn cpc_click_credits_session() {
        let mut events = MockEventStore::new();
        events
            .expect_record_conversion()
            .with(function(|c: &Conversion| {
                c.cost == 2.0
                    && c.session_id == "s1"
                    && c.completed_at.is_some()
                    && c.traffic_source == "fb"
                    && c.visitor.get("birthday") == Some("1990-05-04")
            }))
            .times(1)
            .returning(|_| Ok(9));
        let sessions = fixtures::sessions();
        let t = tracker(repo(linkout(PayoutType::Cpc)), events, Arc::clone(&sessions));

        let out = t.record_click("s1", click()).await.unwrap();
        assert_eq!(out.conversion_id, 9);
        assert_eq!(out.target_url, "https://adv.example/go?ref=1&em=a%40b.com&fn=Ann+Lee");
        let s = sessions.load("s1").await.unwrap();
        assert_eq!((s.linkout_revenue, s.revenue_bucket), (2.0, 2.0));
    }

    #[tokio::test]
    async fn cpa_click_records_zero_cost() {
        let mut events = MockEventStore::new();
        events
            .expect_record_conversion()
            .with(function(|c: &Conversion| {
                c.cost == 0.0 && c.payout_type == PayoutType::Cpa && c.completed_at.is_none()
            }))
            .returning(|_| Ok(10));
        let sessions = fixtures::sessions();
        let mut l = linkout(PayoutType::Cpa);
        l.target_url = Some("https://adv.example/cpa".into());
        l.url_params.truncate(1);
        let t = tracker(repo(l), events, Arc::clone(&sessions));

        let out = t.record_click("s1", click()).await.unwrap();
        assert_eq!(out.target_url, "https://adv.example/cpa?em=a%40b.com");
        assert_eq!(sessions.load("s1").await.unwrap().revenue_bucket, 0.0);
    }

    #[tokio::test]
    async fn click_without_birthday_is_rejected() {
        let mut events = MockEventStore::new();
        events.expect_record_conversion().never();
        let t = tracker(repo(linkout(PayoutType::Cpc)), events, fixtures::sessions());

        let mut req = click();
        req.user_data = VisitorData::from([("email", "a@b.com"), ("year", "1990")]);
        assert!(matches!(t.record_click("s1", req).await, Err(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn unknown_linkout_is_not_found() {
        let t =
            tracker(repo(linkout(PayoutType::Cpc)), MockEventStore::new(), fixtures::sessions());
        let mut req = click();
        req.linkout_id = 6;
        assert!(matches!(t.record_click("s1", req).await, Err(DomainError::NotFound { .. })));
    }

    #[tokio::test]
    async fn hardcoded_params_follow_mapped_ones() {
        let mut l = linkout(PayoutType::Cpc);
        l.url_params.truncate(1);
        l.hardcoded_url_params = vec![
            HardcodedField {
                field: "aff".into(),
                value: "42".into(),
            },
            HardcodedField {
                field: "sub".into(),
                value: "a b".into(),
            },
        ];
        let visitor = VisitorData::from([("email", "a@b.com")]);
        let ctx = EvaluationContext::new(&visitor, monday_morning());
        assert_eq!(
            target_url(&l, &ctx),
            "https://adv.example/go?ref=1&em=a%40b.com&aff=42&sub=a b"
        );

        l.target_url = Some("https://adv.example/go".into());
        l.url_params.clear();
        assert_eq!(target_url(&l, &ctx), "https://adv.example/go?aff=42&sub=a b");
    }

    fn stored(payout_type: PayoutType, completed: bool) -> StoredConversion {
        StoredConversion {
            id: 10,
            record: Conversion {
                linkout_id: 5,
                payout_type,
                cost: 0.0,
                session_id: "s1".into(),
                path_id: Some(1),
                platform: None,
                traffic_source: String::new(),
                visitor: VisitorData::from([("email", "a@b.com")]),
                created_at: monday_morning(),
                completed_at: completed.then(monday_morning),
            },
        }
    }

    fn events_with(conversion: StoredConversion) -> MockEventStore {
        let mut events = MockEventStore::new();
        events
            .expect_find_conversion()
            .returning(move |id| Ok((id == conversion.id).then(|| conversion.clone())));
        events
    }

    fn hashed_linkout() -> Offer {
        let mut l = linkout(PayoutType::Cpa);
        l.id_hash = Some("5f3a".into());
        l
    }

    #[tokio::test]
    async fn cpa_confirmation_credits_session() {
        let mut events = events_with(stored(PayoutType::Cpa, false));
        events
            .expect_complete_conversion()
            .with(eq(10), eq(2.0), always())
            .times(1)
            .returning(|_, _, _| Ok(()));
        let sessions = fixtures::sessions();
        let t = tracker(repo(hashed_linkout()), events, Arc::clone(&sessions));

        let done = t.complete_cpa("s1", 10, Some("5f3a")).await.unwrap();
        assert!(done.credited);
        assert_eq!((done.linkout_id, done.revenue), (5, 2.0));
        assert_eq!(done.visitor.get("email"), Some("a@b.com"));
        let s = sessions.load("s1").await.unwrap();
        assert_eq!((s.linkout_revenue, s.revenue_bucket), (2.0, 2.0));
    }

    #[tokio::test]
    async fn confirmed_conversion_is_not_credited_again() {
        let mut events = events_with(stored(PayoutType::Cpa, true));
        events.expect_complete_conversion().never();
        let sessions = fixtures::sessions();
        let t = tracker(repo(hashed_linkout()), events, Arc::clone(&sessions));

        let done = t.complete_cpa("s1", 10, None).await.unwrap();
        assert!(!done.credited);
        assert_eq!(done.revenue, 2.0);
        assert_eq!(sessions.load("s1").await.unwrap().revenue_bucket, 0.0);
    }

    #[tokio::test]
    async fn cpc_confirmation_does_not_credit_twice() {
        let mut events = events_with(stored(PayoutType::Cpc, true));
        events.expect_complete_conversion().never();
        let sessions = fixtures::sessions();
        let t = tracker(repo(linkout(PayoutType::Cpc)), events, Arc::clone(&sessions));

        assert!(!t.complete_cpa("s1", 10, None).await.unwrap().credited);
        assert_eq!(sessions.load("s1").await.unwrap().linkout_revenue, 0.0);
    }

    #[tokio::test]
    async fn postback_with_wrong_hash_is_rejected() {
        let mut events = events_with(stored(PayoutType::Cpa, false));
        events.expect_complete_conversion().never();
        let sessions = fixtures::sessions();
        let t = tracker(repo(hashed_linkout()), events, Arc::clone(&sessions));

        assert!(matches!(
            t.complete_cpa("s1", 10, Some("beef")).await,
            Err(DomainError::Validation(_))
        ));
        assert_eq!(sessions.load("s1").await.unwrap().revenue_bucket, 0.0);
    }

    #[tokio::test]
    async fn confirmation_from_another_session_is_rejected() {
        let mut events = events_with(stored(PayoutType::Cpa, false));
        events.expect_complete_conversion().never();
        let t = tracker(repo(hashed_linkout()), events, fixtures::sessions());

        assert!(matches!(t.complete_cpa("s2", 10, None).await, Err(DomainError::Validation(_))));
        assert!(matches!(
            t.complete_cpa("s1", 11, None).await,
            Err(DomainError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn skip_carries_advertiser() {
        let mut events = MockEventStore::new();
        events
            .expect_record_skip()
            .with(function(|s: &Skip| s.advertiser_id == 7 && s.offer == OfferRef::soi(3)))
            .returning(|_| Ok(1));
        let t = tracker(repo(offer(OfferKind::Soi, 3)), events, fixtures::sessions());

        let id = t
            .record_skip(SkipRequest {
                offer: OfferRef::soi(3),
                path_id: None,
                user_data: VisitorData::new(),
            })
            .await
            .unwrap();
        assert_eq!(id, 1);
    }
}
