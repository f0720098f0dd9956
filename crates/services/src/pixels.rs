//! # Pixel Service
//!
//! Picks and renders the tracking pixels for one page location. Global
//! pixels fire on traffic scope and revenue threshold; CPA partner pixels
//! draw down the session's revenue bucket through [`crate::revenue::allocate`].
//! A confirmed CPA conversion fires the global `linkouts` pixels its
//! revenue clears, see [`PixelService::conversion_pixels`].

use std::collections::HashMap;
use std::sync::Arc;

use domains::errors::{DomainError, Result};
use domains::models::{Pixel, VisitorData};
use domains::ports::{PixelRepository, TemplateRenderer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::revenue;
use crate::sessions::SessionService;

pub const SPLASH: &str = "splash";
pub const REGISTRATION: &str = "registration";
pub const SURVEY: &str = "survey";
pub const LINKOUTS: &str = "linkouts";
pub const POST_LINKOUT: &str = "post-linkout";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PixelRequest {
    pub location: String,
    #[serde(default)]
    pub utm_content: Option<String>,
    #[serde(default)]
    pub user_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedPixel {
    pub pixel_id: i64,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PixelAllocation {
    pub fired: Vec<RenderedPixel>,
    pub new_bucket: f64,
}

pub struct PixelService {
    pixels: Arc<dyn PixelRepository>,
    renderer: Arc<dyn TemplateRenderer>,
    sessions: Arc<SessionService>,
}

impl PixelService {
    pub fn new(
        pixels: Arc<dyn PixelRepository>,
        renderer: Arc<dyn TemplateRenderer>,
        sessions: Arc<SessionService>,
    ) -> Self {
        Self {
            pixels,
            renderer,
            sessions,
        }
    }

    pub async fn allocate_pixels(
        &self,
        session_id: &str,
        req: PixelRequest,
    ) -> Result<PixelAllocation> {
        let location = req.location.as_str();
        if location != SPLASH && is_blank(req.user_data.as_ref()) {
            return Err(DomainError::Validation("user_data is required".into()));
        }
        let user_data = req.user_data.clone().unwrap_or(Value::Null);
        let utm = req.utm_content.as_deref();

        let session = self.sessions.load(session_id).await?;
        let revenue = match location {
            SURVEY => session.soi_revenue,
            LINKOUTS | POST_LINKOUT => session.linkout_revenue,
            _ => 0.0,
        };
        let threshold_applies = location != SPLASH && location != REGISTRATION;

        let threshold = threshold_applies.then_some(revenue);
        let mut fired = self
            .global_pixels(location, utm, threshold, revenue, &user_data)
            .await?;

        // Render before touching the bucket so a broken template never costs revenue.
        let mut rendered = HashMap::new();
        let candidates: Vec<Pixel> = self
            .pixels
            .enabled_pixels(location, true)
            .await?
            .into_iter()
            .filter(|p| p.matches_traffic(utm))
            .filter(|p| {
                let Some(amount) = p.cpa_amount() else {
                    return false;
                };
                match self.render(p, amount, &user_data) {
                    Some(r) => {
                        rendered.insert(p.id, r);
                        true
                    }
                    None => false,
                }
            })
            .collect();

        let (partner_ids, new_bucket) = self
            .sessions
            .with_session(session_id, |s| {
                let allocation = revenue::allocate(s.revenue_bucket, &candidates);
                s.revenue_bucket = allocation.balance;
                let ids: Vec<i64> = allocation.fired.iter().map(|(p, _)| p.id).collect();
                (ids, allocation.balance)
            })
            .await?;

        fired.extend(partner_ids.into_iter().filter_map(|id| rendered.remove(&id)));
        debug!(location, fired = fired.len(), new_bucket, "pixels allocated");

        Ok(PixelAllocation { fired, new_bucket })
    }

    /// Global `linkouts` pixels for a confirmed conversion worth `revenue`.
    /// The bucket is not touched.
    pub async fn conversion_pixels(
        &self,
        revenue: f64,
        utm_content: Option<&str>,
        visitor: &VisitorData,
    ) -> Result<Vec<RenderedPixel>> {
        let user_data = serde_json::to_value(visitor).unwrap_or_default();
        let fired = self
            .global_pixels(LINKOUTS, utm_content, Some(revenue), revenue, &user_data)
            .await?;
        debug!(revenue, fired = fired.len(), "conversion pixels rendered");
        Ok(fired)
    }

    async fn global_pixels(
        &self,
        location: &str,
        utm: Option<&str>,
        threshold: Option<f64>,
        revenue: f64,
        user_data: &Value,
    ) -> Result<Vec<RenderedPixel>> {
        Ok(self
            .pixels
            .enabled_pixels(location, false)
            .await?
            .iter()
            .filter(|p| p.matches_traffic(utm))
            .filter(|p| threshold.is_none_or(|t| p.revenue_threshold <= t))
            .filter_map(|p| self.render(p, revenue, user_data))
            .collect())
    }

    fn render(&self, pixel: &Pixel, revenue: f64, user_data: &Value) -> Option<RenderedPixel> {
        let context = json!({ "revenue": revenue, "user_data": user_data });
        match self.renderer.render(&pixel.code, &context) {
            Ok(html) => Some(RenderedPixel {
                pixel_id: pixel.id,
                html,
            }),
            Err(e) => {
                warn!(pixel = pixel.id, error = %e, "pixel template failed to render");
                None
            }
        }
    }
}

/// Null, `false`, `""`, `"0"`, `0` and empty arrays or objects all count
/// as no visitor data.
fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.is_empty() || s == "0",
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use domains::ports::{MockPixelRepository, MockTemplateRenderer};
    use mockall::predicate::eq;

    fn global(id: i64, threshold: f64) -> Pixel {
        Pixel {
            id,
            enabled: true,
            all_traffic_source: true,
            revenue_threshold: threshold,
            code: format!("g{id}"),
            ..Default::default()
        }
    }

    fn partner(id: i64, value: f64, margin: f64) -> Pixel {
        Pixel {
            id,
            enabled: true,
            all_traffic_source: true,
            is_cpa_partner: true,
            cpa_value: Some(value),
            cpa_margin_rate: Some(margin),
            code: format!("p{id}"),
            ..Default::default()
        }
    }

    fn echo_renderer() -> MockTemplateRenderer {
        let mut r = MockTemplateRenderer::new();
        r.expect_render().returning(|code, ctx| {
            if code == "broken" {
                return Err(DomainError::Render("unclosed tag".into()));
            }
            Ok(format!("{code}@{}", ctx["revenue"]))
        });
        r
    }

    async fn service(
        globals: Vec<Pixel>,
        partners: Vec<Pixel>,
        bucket: f64,
        soi_revenue: f64,
    ) -> (PixelService, Arc<SessionService>) {
        let mut repo = MockPixelRepository::new();
        repo.expect_enabled_pixels()
            .with(mockall::predicate::always(), eq(false))
            .returning(move |_, _| Ok(globals.clone()));
        repo.expect_enabled_pixels()
            .with(mockall::predicate::always(), eq(true))
            .returning(move |_, _| Ok(partners.clone()));

        let sessions = fixtures::sessions();
        sessions
            .with_session("s1", |s| {
                s.revenue_bucket = bucket;
                s.soi_revenue = soi_revenue;
            })
            .await
            .unwrap();

        let svc =
            PixelService::new(Arc::new(repo), Arc::new(echo_renderer()), Arc::clone(&sessions));
        (svc, sessions)
    }

    fn survey_request() -> PixelRequest {
        PixelRequest {
            location: SURVEY.into(),
            utm_content: Some("fb".into()),
            user_data: Some(json!({ "email": "a@b.com" })),
        }
    }

    #[tokio::test]
    async fn bucket_is_drawn_down_and_persisted() {
        let partners = vec![partner(1, 20.0, 0.5), partner(2, 40.0, 1.0), partner(3, 8.0, 0.25)];
        let (svc, sessions) = service(Vec::new(), partners, 100.0, 0.0).await;

        let out = svc.allocate_pixels("s1", survey_request()).await.unwrap();
        let ids: Vec<i64> = out.fired.iter().map(|p| p.pixel_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(out.new_bucket, 60.0);
        assert_eq!(out.fired[0].html, "p1@30.0");
        assert_eq!(sessions.load("s1").await.unwrap().revenue_bucket, 60.0);
    }

    #[tokio::test]
    async fn global_pixels_respect_threshold_outside_splash() {
        let (svc, _) = service(vec![global(1, 5.0), global(2, 50.0)], Vec::new(), 0.0, 10.0).await;

        let out = svc.allocate_pixels("s1", survey_request()).await.unwrap();
        assert_eq!(out.fired, vec![RenderedPixel { pixel_id: 1, html: "g1@10.0".into() }]);

        let splash = PixelRequest {
            location: SPLASH.into(),
            utm_content: None,
            user_data: None,
        };
        let out = svc.allocate_pixels("s1", splash).await.unwrap();
        // splash has no revenue context and no threshold
        assert_eq!(out.fired.len(), 2);
        assert_eq!(out.fired[1].html, "g2@0.0");
    }

    #[tokio::test]
    async fn broken_template_is_skipped_without_debit() {
        let mut broken = partner(1, 20.0, 0.5);
        broken.code = "broken".into();
        let (svc, _) = service(Vec::new(), vec![broken, partner(2, 40.0, 1.0)], 100.0, 0.0).await;

        let out = svc.allocate_pixels("s1", survey_request()).await.unwrap();
        assert_eq!(out.fired.len(), 1);
        assert_eq!(out.fired[0].pixel_id, 2);
        assert_eq!(out.new_bucket, 20.0);
    }

    #[tokio::test]
    async fn user_data_required_off_splash() {
        let (svc, _) = service(Vec::new(), Vec::new(), 0.0, 0.0).await;
        let req = PixelRequest {
            location: SURVEY.into(),
            ..Default::default()
        };
        assert!(matches!(
            svc.allocate_pixels("s1", req).await,
            Err(DomainError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn empty_user_data_counts_as_missing() {
        let (svc, _) = service(Vec::new(), Vec::new(), 0.0, 0.0).await;
        for blank in [json!({}), json!(""), json!([]), Value::Null] {
            let req = PixelRequest {
                location: SURVEY.into(),
                user_data: Some(blank),
                ..Default::default()
            };
            assert!(matches!(
                svc.allocate_pixels("s1", req).await,
                Err(DomainError::Validation(_))
            ));
        }

        let splash = PixelRequest {
            location: SPLASH.into(),
            user_data: Some(json!({})),
            ..Default::default()
        };
        assert!(svc.allocate_pixels("s1", splash).await.is_ok());
    }

    #[tokio::test]
    async fn conversion_pixels_gate_on_revenue_only() {
        let mut scoped = global(3, 1.0);
        scoped.all_traffic_source = false;
        scoped.traffic_source = "fb_spring".into();
        let globals = vec![global(1, 2.0), global(2, 5.0), scoped];
        let (svc, sessions) = service(globals, vec![partner(9, 1.0, 1.0)], 10.0, 0.0).await;

        let visitor = VisitorData::from([("email", "a@b.com")]);
        let fired = svc.conversion_pixels(4.0, None, &visitor).await.unwrap();
        assert_eq!(fired, vec![RenderedPixel { pixel_id: 1, html: "g1@4.0".into() }]);

        let ids: Vec<i64> = svc
            .conversion_pixels(4.0, Some("fb_spring"), &visitor)
            .await
            .unwrap()
            .iter()
            .map(|p| p.pixel_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(sessions.load("s1").await.unwrap().revenue_bucket, 10.0);
    }

    #[tokio::test]
    async fn traffic_scope_filters_partners() {
        let mut scoped = partner(1, 10.0, 1.0);
        scoped.all_traffic_source = false;
        scoped.traffic_source = "google_ads".into();
        let (svc, _) = service(Vec::new(), vec![scoped], 100.0, 0.0).await;

        let out = svc.allocate_pixels("s1", survey_request()).await.unwrap();
        assert!(out.fired.is_empty());
        assert_eq!(out.new_bucket, 100.0);
    }
}
