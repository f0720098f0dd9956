//! DashMap-backed store implementing every persistence port.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use domains::errors::{DomainError, Result};
use domains::models::{
    Conversion, Lead, LeadStatus, NewLead, Offer, OfferKind, OfferRef, Path, PathOffers, Pixel,
    SessionContext, Skip, SoiGroup, StoredConversion,
};
use domains::ports::{
    CapCounter, EventStore, OfferRepository, PixelRepository, SessionStore, VerificationCache,
};
use serde::Deserialize;
use tracing::debug;

/// Initial catalogue for a store, usually read from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub paths: Vec<PathOffers>,
    #[serde(default)]
    pub offers: Vec<Offer>,
    #[serde(default)]
    pub pixels: Vec<Pixel>,
    /// Email → cached verification verdict.
    #[serde(default)]
    pub verified_emails: Vec<(String, bool)>,
}

/// Path layout by offer reference, so offer edits show up in every path.
#[derive(Debug, Clone)]
struct PathLayout {
    path: Path,
    soi_groups: Vec<(i64, Vec<i64>)>,
    linkouts: Vec<i64>,
}

#[derive(Default)]
pub struct InMemoryStore {
    paths: DashMap<i64, PathLayout>,
    offers: DashMap<OfferRef, Offer>,
    pixels: DashMap<i64, Pixel>,
    verifications: DashMap<String, bool>,
    sessions: DashMap<String, SessionContext>,
    leads: DashMap<i64, Lead>,
    conversions: DashMap<i64, Conversion>,
    skips: DashMap<i64, Skip>,
    next_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        for path in seed.paths {
            store.insert_path(path);
        }
        for offer in seed.offers {
            store.insert_offer(offer);
        }
        for pixel in seed.pixels {
            store.insert_pixel(pixel);
        }
        for (email, valid) in seed.verified_emails {
            store.set_email_verified(&email, valid);
        }
        debug!(paths = store.paths.len(), offers = store.offers.len(), "in-memory store seeded");
        store
    }

    /// Stores the path and every offer it references.
    pub fn insert_path(&self, path_offers: PathOffers) {
        let layout = PathLayout {
            path: path_offers.path.clone(),
            soi_groups: path_offers
                .soi_groups
                .iter()
                .map(|g| (g.question_id, g.offers.iter().map(|o| o.id).collect()))
                .collect(),
            linkouts: path_offers.linkouts.iter().map(|o| o.id).collect(),
        };
        for offer in path_offers.soi_groups.into_iter().flat_map(|g| g.offers) {
            self.insert_offer(offer);
        }
        for offer in path_offers.linkouts {
            self.insert_offer(offer);
        }
        self.paths.insert(layout.path.id, layout);
    }

    pub fn insert_offer(&self, offer: Offer) {
        self.offers.insert(offer.offer_ref(), offer);
    }

    pub fn insert_pixel(&self, pixel: Pixel) {
        self.pixels.insert(pixel.id, pixel);
    }

    pub fn set_email_verified(&self, email: &str, valid: bool) {
        self.verifications.insert(email.to_lowercase(), valid);
    }

    /// Recorded leads in id order.
    pub fn leads(&self) -> Vec<Lead> {
        sorted_by_id(self.leads.iter().map(|e| (*e.key(), e.value().clone())))
    }

    pub fn conversions(&self) -> Vec<Conversion> {
        sorted_by_id(self.conversions.iter().map(|e| (*e.key(), e.value().clone())))
    }

    pub fn skips(&self) -> Vec<Skip> {
        sorted_by_id(self.skips.iter().map(|e| (*e.key(), e.value().clone())))
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn resolve_offers(&self, kind: OfferKind, ids: &[i64]) -> Vec<Offer> {
        ids.iter()
            .filter_map(|id| self.offers.get(&OfferRef { kind, id: *id }).map(|o| o.clone()))
            .collect()
    }
}

fn sorted_by_id<T>(items: impl Iterator<Item = (i64, T)>) -> Vec<T> {
    let mut items: Vec<(i64, T)> = items.collect();
    items.sort_by_key(|(id, _)| *id);
    items.into_iter().map(|(_, item)| item).collect()
}

fn on_or_after(created_at: NaiveDateTime, since: Option<NaiveDateTime>) -> bool {
    since.is_none_or(|since| created_at >= since)
}

#[async_trait]
impl OfferRepository for InMemoryStore {
    async fn path_offers(&self, path_id: i64) -> Result<Option<PathOffers>> {
        let Some(layout) = self.paths.get(&path_id).map(|l| l.clone()) else {
            return Ok(None);
        };
        Ok(Some(PathOffers {
            path: layout.path,
            soi_groups: layout
                .soi_groups
                .iter()
                .map(|(question_id, ids)| SoiGroup {
                    question_id: *question_id,
                    offers: self.resolve_offers(OfferKind::Soi, ids),
                })
                .collect(),
            linkouts: self.resolve_offers(OfferKind::Linkout, &layout.linkouts),
        }))
    }

    async fn find_offer(&self, offer: OfferRef) -> Result<Option<Offer>> {
        Ok(self.offers.get(&offer).map(|o| o.clone()))
    }
}

/// SOIs count delivered leads; linkouts count click conversions.
#[async_trait]
impl CapCounter for InMemoryStore {
    async fn count_events(&self, offer: OfferRef, since: Option<NaiveDateTime>) -> Result<u64> {
        let count = match offer.kind {
            OfferKind::Soi => self
                .leads
                .iter()
                .filter(|l| {
                    l.record.soi_id == offer.id
                        && l.record.status == LeadStatus::Delivered
                        && on_or_after(l.record.created_at, since)
                })
                .count(),
            OfferKind::Linkout => self
                .conversions
                .iter()
                .filter(|c| c.linkout_id == offer.id && on_or_after(c.created_at, since))
                .count(),
        };
        Ok(count as u64)
    }
}

#[async_trait]
impl VerificationCache for InMemoryStore {
    async fn email_verified(&self, email: &str) -> Result<Option<bool>> {
        Ok(self.verifications.get(&email.to_lowercase()).map(|v| *v))
    }
}

#[async_trait]
impl PixelRepository for InMemoryStore {
    async fn enabled_pixels(&self, location: &str, cpa_partner: bool) -> Result<Vec<Pixel>> {
        Ok(sorted_by_id(
            self.pixels
                .iter()
                .filter(|p| p.enabled && p.location == location && p.is_cpa_partner == cpa_partner)
                .map(|p| (p.id, p.clone())),
        ))
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn load(&self, session_id: &str) -> Result<SessionContext> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| SessionContext::new(session_id)))
    }

    async fn save(&self, session: &SessionContext) -> Result<()> {
        self.sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn record_lead(&self, lead: &NewLead) -> Result<i64> {
        let id = self.next_id();
        self.leads.insert(
            id,
            Lead {
                id,
                record: lead.clone(),
            },
        );
        Ok(id)
    }

    async fn find_lead(&self, id: i64) -> Result<Option<Lead>> {
        Ok(self.leads.get(&id).map(|l| l.clone()))
    }

    async fn update_lead_submission(
        &self,
        id: i64,
        status: LeadStatus,
        submission_response: &str,
    ) -> Result<()> {
        let mut lead = self.leads.get_mut(&id).ok_or_else(|| DomainError::not_found("lead", id))?;
        lead.record.status = status;
        lead.record.submission_response = submission_response.to_string();
        Ok(())
    }

    async fn record_conversion(&self, conversion: &Conversion) -> Result<i64> {
        let id = self.next_id();
        self.conversions.insert(id, conversion.clone());
        Ok(id)
    }

    async fn find_conversion(&self, id: i64) -> Result<Option<StoredConversion>> {
        Ok(self.conversions.get(&id).map(|c| StoredConversion {
            id,
            record: c.clone(),
        }))
    }

    async fn complete_conversion(
        &self,
        id: i64,
        cost: f64,
        completed_at: NaiveDateTime,
    ) -> Result<()> {
        let mut conversion = self
            .conversions
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found("conversion", id))?;
        conversion.cost = cost;
        conversion.completed_at = Some(completed_at);
        Ok(())
    }

    async fn record_skip(&self, skip: &Skip) -> Result<i64> {
        let id = self.next_id();
        self.skips.insert(id, skip.clone());
        Ok(id)
    }
}
