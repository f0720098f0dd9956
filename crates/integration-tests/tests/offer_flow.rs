//! A visitor's whole funnel run through the services over the in-memory
//! store: listing, pre-ping confirmation, lead delivery, caps, a linkout
//! click and bucket-funded pixels.

use std::sync::Arc;
use std::time::Duration;

use api_adapters::PixelTemplateRenderer;
use async_trait::async_trait;
use chrono::NaiveDate;
use domains::errors::TransportError;
use domains::models::{LeadStatus, OfferKind, OfferRef, VisitorData};
use domains::ports::{FixedClock, HttpClient, HttpResponse, OutboundRequest};
use serde_json::json;
use services::{
    ClickRequest, ConversionTracker, EligibilityEngine, EngineOptions, LeadDispatcher,
    LeadSubmission, OfferCapTracker, OfferService, PixelRequest, PixelService, PrePingCoordinator,
    SessionService,
};
use storage_adapters::{InMemoryStore, Seed};

/// Accepts fast pre-pings and leads; the `slow` endpoint never answers in time.
struct Advertisers;

#[async_trait]
impl HttpClient for Advertisers {
    async fn execute(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError> {
        if request.url.contains("slow") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        let body = if request.url.contains("lead") { "Success" } else { "ACCEPT" };
        Ok(HttpResponse {
            status: 200,
            body: body.into(),
        })
    }
}

fn soi(id: i64, extra: serde_json::Value) -> serde_json::Value {
    let mut offer = json!({
        "id": id, "kind": "soi", "enabled": true, "admin_label": format!("SOI {id}"),
        "advertiser": { "id": 100 + id, "title": "Acme" }, "cost": 4.0,
        "posting": {
            "url": "http://adv.test/lead", "method": "http_get", "success_string": "success"
        }
    });
    if let (Some(base), Some(extra)) = (offer.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    offer
}

fn pre_ping(url: &str) -> serde_json::Value {
    json!({ "pre_ping": {
        "enabled": true, "url": url, "method": "get",
        "success_response": "ACCEPT", "positive": true,
        "url_params": [{ "field": "email", "client_field": "em" }]
    }})
}

fn seed() -> Seed {
    let no_days = vec![false; 7];
    let no_hours = vec![json!({}); 7];
    let adults = json!({ "field": "age", "operator": "between", "value": "18,65" });
    let closed = json!({ "active_days": no_days, "hours": no_hours, "total_cap": 1 });
    serde_json::from_value(json!({
        "paths": [{
            "path": {
                "id": 1, "slug": "main",
                "max_sois_shown_per_question": null, "max_linkouts_shown": null
            },
            "soi_groups": [{
                "question_id": 1,
                "offers": [
                    soi(10, json!({ "demographic_filters": [adults] })),
                    soi(11, pre_ping("http://adv.test/fast")),
                    soi(12, pre_ping("http://adv.test/slow")),
                    soi(13, json!({ "active_times": closed })),
                ]
            }],
            "linkouts": [
                {
                    "id": 20, "kind": "linkout", "enabled": true, "admin_label": "Credit",
                    "advertiser": { "id": 9, "title": "Lendco" }, "cost": 2.0, "payout_type": "cpc",
                    "target_url": "https://adv.test/go?src=funnel"
                },
                {
                    "id": 21, "kind": "linkout", "enabled": true, "admin_label": "Blocked",
                    "advertiser": { "id": 9, "title": "Lendco" }, "cost": 2.0,
                    "blacklists": [{ "field": "state", "values": "NY, CA" }]
                }
            ]
        }],
        "pixels": [
            { "id": 1, "location": "linkouts", "enabled": true, "all_traffic_source": true,
              "is_cpa_partner": true, "cpa_value": 2.0, "cpa_margin_rate": 0.5,
              "code": "<img src=\"/a?r={{ revenue }}\">" },
            { "id": 2, "location": "linkouts", "enabled": true, "all_traffic_source": true,
              "is_cpa_partner": true, "cpa_value": 4.0, "cpa_margin_rate": 0.25,
              "code": "<img src=\"/b\">" },
            { "id": 3, "location": "linkouts", "enabled": true, "all_traffic_source": true,
              "revenue_threshold": 1.5,
              "code": "<img src=\"/g?e={{ user_data.email | url_encode }}\">" }
        ]
    }))
    .unwrap()
}

struct Funnel {
    store: Arc<InMemoryStore>,
    offers: OfferService,
    leads: LeadDispatcher,
    tracking: ConversionTracker,
    pixels: PixelService,
    sessions: Arc<SessionService>,
}

fn funnel() -> Funnel {
    let store = Arc::new(InMemoryStore::from_seed(seed()));
    let http: Arc<dyn HttpClient> = Arc::new(Advertisers);
    let clock = Arc::new(FixedClock(
        NaiveDate::from_ymd_opt(2026, 5, 4).unwrap().and_hms_opt(10, 30, 0).unwrap(),
    ));
    let sessions = Arc::new(SessionService::new(store.clone()));

    Funnel {
        offers: OfferService::new(
            store.clone(),
            store.clone(),
            OfferCapTracker::new(store.clone()),
            PrePingCoordinator::new(http.clone(), Duration::from_secs(30)),
            EligibilityEngine::new(EngineOptions::default()),
            clock.clone(),
        ),
        leads: LeadDispatcher::new(
            store.clone(),
            store.clone(),
            http,
            sessions.clone(),
            clock.clone(),
            Duration::from_secs(15),
        ),
        tracking: ConversionTracker::new(store.clone(), store.clone(), sessions.clone(), clock),
        pixels: PixelService::new(
            store.clone(),
            Arc::new(PixelTemplateRenderer::new()),
            sessions.clone(),
        ),
        sessions,
        store,
    }
}

fn visitor() -> VisitorData {
    VisitorData::from([
        ("email", "ann@example.com"),
        ("birthday", "1990-03-02"),
        ("state", "CA"),
    ])
}

fn ids(refs: impl IntoIterator<Item = OfferRef>) -> Vec<(OfferKind, i64)> {
    refs.into_iter().map(|r| (r.kind, r.id)).collect()
}

#[tokio::test(start_paused = true)]
async fn visitor_funnel_end_to_end() {
    let f = funnel();
    let session = "visitor-1";
    f.sessions.start_path(session).await.unwrap();

    let listed = f.offers.evaluate_offers(1, &visitor()).await.unwrap();
    assert_eq!(
        ids(listed.admitted.iter().map(|o| o.offer)),
        vec![(OfferKind::Soi, 10), (OfferKind::Soi, 13), (OfferKind::Linkout, 20)]
    );
    assert_eq!(
        ids(listed.pre_ping_pending.iter().map(|p| p.offer)),
        vec![(OfferKind::Soi, 11), (OfferKind::Soi, 12)]
    );

    let pending: Vec<OfferRef> = listed.pre_ping_pending.iter().map(|p| p.offer).collect();
    let confirmed = f.offers.resolve_pre_ping(&pending, &visitor()).await.unwrap();
    assert_eq!(ids(confirmed.confirmed), vec![(OfferKind::Soi, 11)]);

    let outcome = f
        .leads
        .submit(
            session,
            LeadSubmission {
                soi_id: 13,
                path_id: Some(1),
                user_data: visitor(),
                ..LeadSubmission::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, LeadStatus::Delivered);

    // SOI 13 reached its total cap of one delivered lead.
    let relisted = f.offers.evaluate_offers(1, &visitor()).await.unwrap();
    assert_eq!(
        ids(relisted.admitted.iter().map(|o| o.offer)),
        vec![(OfferKind::Soi, 10), (OfferKind::Linkout, 20)]
    );

    f.sessions.start_linkouts(session).await.unwrap();
    let click = f
        .tracking
        .record_click(
            session,
            ClickRequest {
                linkout_id: 20,
                path_id: Some(1),
                user_data: visitor(),
                ..ClickRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(click.target_url, "https://adv.test/go?src=funnel");

    let state = f.sessions.load(session).await.unwrap();
    assert_eq!(state.revenue_bucket, 6.0);
    assert_eq!(state.soi_revenue, 4.0);
    assert_eq!(state.linkout_revenue, 2.0);

    let allocation = f
        .pixels
        .allocate_pixels(
            session,
            PixelRequest {
                location: "linkouts".into(),
                user_data: Some(json!({ "email": "ann@example.com" })),
                ..PixelRequest::default()
            },
        )
        .await
        .unwrap();
    let fired: Vec<(i64, &str)> =
        allocation.fired.iter().map(|p| (p.pixel_id, p.html.as_str())).collect();
    assert_eq!(
        fired,
        vec![
            (3, "<img src=\"/g?e=ann%40example.com\">"),
            (1, "<img src=\"/a?r=3\">"),
        ]
    );
    assert_eq!(allocation.new_bucket, 3.0);
    assert_eq!(f.sessions.load(session).await.unwrap().revenue_bucket, 3.0);

    assert_eq!(f.store.leads().len(), 1);
    assert_eq!(f.store.conversions().len(), 1);
}

#[tokio::test]
async fn rejected_lead_is_recorded_but_not_credited() {
    let f = funnel();
    f.store.insert_offer(
        serde_json::from_value(soi(30, json!({ "posting": {
            "url": "http://adv.test/lead", "method": "http_get", "success_string": "never-matches"
        }})))
        .unwrap(),
    );

    let outcome = f
        .leads
        .submit(
            "visitor-2",
            LeadSubmission {
                soi_id: 30,
                ..LeadSubmission::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, LeadStatus::Rejected);
    assert!(!outcome.delivered);
    assert_eq!(f.store.leads()[0].record.submission_response, "Success");
    assert_eq!(f.sessions.load("visitor-2").await.unwrap().revenue_bucket, 0.0);
}
