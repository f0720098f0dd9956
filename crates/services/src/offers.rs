//! # Offer Service
//!
//! Entry points for listing a path's offers and confirming the ones that
//! need pre-ping verification. Listing runs the eligibility engine and cap
//! tracker per offer; offers with an enabled pre-ping are handed back as
//! pending and only admitted once [`OfferService::resolve_pre_ping`] has
//! confirmed them and the full filter chain passes.

use std::sync::Arc;

use chrono::NaiveDateTime;
use domains::errors::{DomainError, Result};
use domains::models::{Offer, OfferKind, OfferRef, PayoutType, PlatformFilter, VisitorData};
use domains::ports::{Clock, OfferRepository, VerificationCache};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::attributes::EvaluationContext;
use crate::caps::OfferCapTracker;
use crate::eligibility::EligibilityEngine;
use crate::preping::PrePingCoordinator;

/// What the client needs to display an admitted offer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferSummary {
    pub offer: OfferRef,
    pub question_id: Option<i64>,
    pub admin_label: String,
    pub advertiser_id: i64,
    pub cost: f64,
    pub payout_type: PayoutType,
    pub target_url: Option<String>,
    /// Device targeting, applied by the client.
    pub platform: PlatformFilter,
}

impl OfferSummary {
    fn new(offer: &Offer, question_id: Option<i64>) -> Self {
        Self {
            offer: offer.offer_ref(),
            question_id,
            admin_label: offer.admin_label.clone(),
            advertiser_id: offer.advertiser.id,
            cost: offer.cost,
            payout_type: offer.payout_type,
            target_url: offer.target_url.clone(),
            platform: offer.platform,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOffer {
    pub offer: OfferRef,
    pub question_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluatedOffers {
    pub admitted: Vec<OfferSummary>,
    pub pre_ping_pending: Vec<PendingOffer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfirmedOffers {
    pub confirmed: Vec<OfferRef>,
    pub offers: Vec<OfferSummary>,
}

pub struct OfferService {
    offers: Arc<dyn OfferRepository>,
    verification: Arc<dyn VerificationCache>,
    caps: OfferCapTracker,
    pre_ping: PrePingCoordinator,
    engine: EligibilityEngine,
    clock: Arc<dyn Clock>,
}

impl OfferService {
    pub fn new(
        offers: Arc<dyn OfferRepository>,
        verification: Arc<dyn VerificationCache>,
        caps: OfferCapTracker,
        pre_ping: PrePingCoordinator,
        engine: EligibilityEngine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            offers,
            verification,
            caps,
            pre_ping,
            engine,
            clock,
        }
    }

    pub fn pre_ping(&self) -> &PrePingCoordinator {
        &self.pre_ping
    }

    /// Admitted SOIs (grouped by question, in display order) followed by
    /// admitted linkouts, plus the offers awaiting pre-ping. Pending entries
    /// count toward the path's display limits.
    pub async fn evaluate_offers(
        &self,
        path_id: i64,
        visitor: &VisitorData,
    ) -> Result<EvaluatedOffers> {
        let path_offers = self
            .offers
            .path_offers(path_id)
            .await?
            .ok_or_else(|| DomainError::not_found("path", path_id))?;
        let now = self.clock.now();
        let ctx = self.context(visitor, now).await;
        let mut result = EvaluatedOffers::default();

        let soi_limit = display_limit(path_offers.path.max_sois_shown_per_question);
        for group in &path_offers.soi_groups {
            let mut shown = 0;
            for soi in group.offers.iter().filter(|o| o.enabled) {
                if soi.requires_pre_ping() {
                    result.pre_ping_pending.push(PendingOffer {
                        offer: soi.offer_ref(),
                        question_id: Some(group.question_id),
                    });
                } else if self.engine.passes_filters(soi, &ctx)
                    && self.caps.under_cap(soi, now).await?
                {
                    result.admitted.push(OfferSummary::new(soi, Some(group.question_id)));
                } else {
                    continue;
                }

                shown += 1;
                if soi_limit.is_some_and(|limit| shown >= limit) {
                    break;
                }
            }
        }

        let linkout_limit = display_limit(path_offers.path.max_linkouts_shown);
        let mut shown = 0;
        for linkout in path_offers.linkouts.iter().filter(|o| o.enabled) {
            if !self.caps.under_cap(linkout, now).await? {
                debug!(offer = %linkout.offer_ref(), "rejected: cap reached");
                continue;
            }
            if linkout.requires_pre_ping() {
                result.pre_ping_pending.push(PendingOffer {
                    offer: linkout.offer_ref(),
                    question_id: None,
                });
            } else if self.engine.passes_filters(linkout, &ctx) {
                result.admitted.push(OfferSummary::new(linkout, None));
            } else {
                continue;
            }

            shown += 1;
            if linkout_limit.is_some_and(|limit| shown >= limit) {
                break;
            }
        }

        info!(
            path_id,
            admitted = result.admitted.len(),
            pending = result.pre_ping_pending.len(),
            "offers evaluated"
        );
        Ok(result)
    }

    /// Runs pre-ping for the given offers and re-checks the survivors.
    /// Unknown, disabled or non-pre-ping references are dropped.
    pub async fn resolve_pre_ping(
        &self,
        refs: &[OfferRef],
        visitor: &VisitorData,
    ) -> Result<ConfirmedOffers> {
        let mut candidates = Vec::with_capacity(refs.len());
        for offer_ref in refs {
            match self.offers.find_offer(*offer_ref).await? {
                Some(offer) if offer.enabled && offer.requires_pre_ping() => candidates.push(offer),
                Some(_) => debug!(offer = %offer_ref, "dropped: disabled or no pre-ping"),
                None => debug!(offer = %offer_ref, "dropped: not found"),
            }
        }

        let now = self.clock.now();
        let ctx = self.context(visitor, now).await;
        let positive = self.pre_ping.resolve(candidates, &ctx).await;

        let mut confirmed = ConfirmedOffers::default();
        for offer in positive {
            if !self.engine.is_eligible(&offer, &ctx) {
                continue;
            }
            // Linkouts were cap-checked when listed.
            if offer.kind == OfferKind::Soi && !self.caps.under_cap(&offer, now).await? {
                debug!(offer = %offer.offer_ref(), "rejected: cap reached");
                continue;
            }
            confirmed.confirmed.push(offer.offer_ref());
            confirmed.offers.push(OfferSummary::new(&offer, None));
        }

        info!(requested = refs.len(), confirmed = confirmed.confirmed.len(), "pre-ping resolved");
        Ok(confirmed)
    }

    /// Prefetches the cached email verification so evaluation stays pure.
    async fn context<'a>(
        &self,
        visitor: &'a VisitorData,
        now: NaiveDateTime,
    ) -> EvaluationContext<'a> {
        let ctx = EvaluationContext::new(visitor, now);
        let Some(email) = visitor.get("email") else {
            return ctx;
        };
        match self.verification.email_verified(email).await {
            Ok(verified) => ctx.with_email_verified(verified),
            Err(e) => {
                warn!(error = %e, "email verification lookup failed");
                ctx
            }
        }
    }
}

fn display_limit(max: Option<u32>) -> Option<u32> {
    max.filter(|m| *m > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{monday_morning, offer};
    use async_trait::async_trait;
    use domains::errors::TransportError;
    use domains::models::{
        DemographicFilter, HttpMethod, Path, PathOffers, PrePingConfig, SoiGroup,
    };
    use domains::ports::{
        FixedClock, HttpClient, HttpResponse, MockCapCounter, MockHttpClient, MockOfferRepository,
        MockVerificationCache, OutboundRequest,
    };
    use std::time::Duration;

    struct AcceptAll;

    #[async_trait]
    impl HttpClient for AcceptAll {
        async fn execute(
            &self,
            req: OutboundRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            let body = if req.url.ends_with("/yes") { "OK" } else { "NO" };
            Ok(HttpResponse {
                status: 200,
                body: body.into(),
            })
        }
    }

    fn with_pre_ping(mut o: Offer, url: &str) -> Offer {
        o.pre_ping = Some(PrePingConfig {
            enabled: true,
            url: url.into(),
            method: HttpMethod::Get,
            success_response: "OK".into(),
            positive: true,
            url_params: Vec::new(),
        });
        o
    }

    fn gated(mut o: Offer) -> Offer {
        o.demographic_filters = vec![DemographicFilter::new("state", "eq", "CA")];
        o
    }

    fn path_offers(max_sois: Option<u32>, max_linkouts: Option<u32>) -> PathOffers {
        let mut disabled = offer(OfferKind::Soi, 4);
        disabled.enabled = false;
        PathOffers {
            path: Path {
                id: 1,
                slug: "main".into(),
                max_sois_shown_per_question: max_sois,
                max_linkouts_shown: max_linkouts,
            },
            soi_groups: vec![
                SoiGroup {
                    question_id: 100,
                    offers: vec![
                        disabled,
                        gated(offer(OfferKind::Soi, 1)),
                        with_pre_ping(offer(OfferKind::Soi, 2), "http://pp/yes"),
                        offer(OfferKind::Soi, 3),
                    ],
                },
                SoiGroup {
                    question_id: 200,
                    offers: vec![offer(OfferKind::Soi, 5)],
                },
            ],
            linkouts: vec![
                offer(OfferKind::Linkout, 10),
                with_pre_ping(offer(OfferKind::Linkout, 11), "http://pp/no"),
                offer(OfferKind::Linkout, 12),
            ],
        }
    }

    fn service(paths: PathOffers, verified: Option<bool>) -> OfferService {
        let catalog: Vec<Offer> = paths
            .soi_groups
            .iter()
            .flat_map(|g| g.offers.clone())
            .chain(paths.linkouts.clone())
            .collect();
        let mut repo = MockOfferRepository::new();
        repo.expect_path_offers()
            .returning(move |id| Ok((id == 1).then(|| paths.clone())));
        repo.expect_find_offer()
            .returning(move |r| Ok(catalog.iter().find(|o| o.offer_ref() == r).cloned()));

        let mut counter = MockCapCounter::new();
        counter.expect_count_events().returning(|_, _| Ok(0));
        let mut cache = MockVerificationCache::new();
        cache.expect_email_verified().returning(move |_| Ok(verified));

        OfferService::new(
            Arc::new(repo),
            Arc::new(cache),
            OfferCapTracker::new(Arc::new(counter)),
            PrePingCoordinator::new(Arc::new(AcceptAll), Duration::from_secs(30)),
            EligibilityEngine::default(),
            Arc::new(FixedClock(monday_morning())),
        )
    }

    fn ids(summaries: &[OfferSummary]) -> Vec<OfferRef> {
        summaries.iter().map(|s| s.offer).collect()
    }

    #[tokio::test]
    async fn lists_admitted_and_pending() {
        let svc = service(path_offers(None, None), None);
        let visitor = VisitorData::from([("state", "NY")]);

        let out = svc.evaluate_offers(1, &visitor).await.unwrap();
        assert_eq!(
            ids(&out.admitted),
            vec![OfferRef::soi(3), OfferRef::soi(5), OfferRef::linkout(10), OfferRef::linkout(12)]
        );
        assert_eq!(
            out.pre_ping_pending,
            vec![
                PendingOffer {
                    offer: OfferRef::soi(2),
                    question_id: Some(100)
                },
                PendingOffer {
                    offer: OfferRef::linkout(11),
                    question_id: None
                },
            ]
        );
        assert_eq!(out.admitted[0].question_id, Some(100));
    }

    #[tokio::test]
    async fn pending_entries_count_toward_limits() {
        let svc = service(path_offers(Some(1), Some(2)), None);
        let visitor = VisitorData::from([("state", "NY")]);

        let out = svc.evaluate_offers(1, &visitor).await.unwrap();
        // question 100 stops at the pending SOI 2
        assert_eq!(ids(&out.admitted), vec![OfferRef::soi(5), OfferRef::linkout(10)]);
        assert_eq!(out.pre_ping_pending.len(), 2);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let svc = service(path_offers(None, None), None);
        assert!(matches!(
            svc.evaluate_offers(9, &VisitorData::new()).await,
            Err(DomainError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn capped_linkout_is_not_pending() {
        let mut paths = path_offers(None, None);
        paths.linkouts[1].active_times = Some(domains::models::ActiveTimesCapsFilter {
            total_cap: Some(1),
            ..Default::default()
        });
        let mut repo = MockOfferRepository::new();
        repo.expect_path_offers().returning(move |_| Ok(Some(paths.clone())));
        let mut counter = MockCapCounter::new();
        counter.expect_count_events().returning(|_, _| Ok(1));
        let svc = OfferService::new(
            Arc::new(repo),
            Arc::new(MockVerificationCache::new()),
            OfferCapTracker::new(Arc::new(counter)),
            PrePingCoordinator::new(Arc::new(MockHttpClient::new()), Duration::from_secs(30)),
            EligibilityEngine::default(),
            Arc::new(FixedClock(monday_morning())),
        );

        let out = svc.evaluate_offers(1, &VisitorData::new()).await.unwrap();
        assert_eq!(
            out.pre_ping_pending,
            vec![PendingOffer { offer: OfferRef::soi(2), question_id: Some(100) }]
        );
    }

    #[tokio::test]
    async fn resolve_confirms_positive_and_eligible() {
        let mut paths = path_offers(None, None);
        paths.soi_groups[1].offers =
            vec![gated(with_pre_ping(offer(OfferKind::Soi, 6), "http://pp/yes"))];
        let svc = service(paths, None);
        let visitor = VisitorData::from([("state", "NY")]);

        let refs = [
            OfferRef::soi(2),
            OfferRef::linkout(11),
            OfferRef::soi(6),
            OfferRef::soi(3),
            OfferRef::soi(404),
        ];
        let out = svc.resolve_pre_ping(&refs, &visitor).await.unwrap();
        // 11 answered NO, 6 fails its filter, 3 has no pre-ping, 404 is unknown
        assert_eq!(out.confirmed, vec![OfferRef::soi(2)]);
        assert_eq!(ids(&out.offers), vec![OfferRef::soi(2)]);
    }

    #[tokio::test]
    async fn verification_result_reaches_filters() {
        let mut paths = path_offers(None, None);
        let mut verified_only = offer(OfferKind::Linkout, 13);
        verified_only.demographic_filters =
            vec![DemographicFilter::new("brite_verify_valid", "eq", "1")];
        paths.linkouts = vec![verified_only];
        let visitor = VisitorData::from([("email", "a@b.com")]);

        let out = service(paths.clone(), Some(true)).evaluate_offers(1, &visitor).await.unwrap();
        assert_eq!(ids(&out.admitted), vec![OfferRef::linkout(13)]);

        let out = service(paths, Some(false)).evaluate_offers(1, &visitor).await.unwrap();
        assert!(out.admitted.is_empty());
    }
}
