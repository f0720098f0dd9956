//! Shared builders for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use domains::errors::Result;
use domains::models::{AdvertiserRef, Offer, OfferKind, PayoutType, PlatformFilter, SessionContext};
use domains::ports::SessionStore;

use crate::sessions::SessionService;

pub(crate) fn offer(kind: OfferKind, id: i64) -> Offer {
    Offer {
        id,
        kind,
        enabled: true,
        admin_label: format!("offer {id}"),
        advertiser: AdvertiserRef {
            id: 7,
            title: "Acme".into(),
        },
        cost: 1.5,
        payout_type: PayoutType::Cpc,
        posting: None,
        target_url: None,
        url_params: Vec::new(),
        hardcoded_url_params: Vec::new(),
        id_hash: None,
        pre_ping: None,
        active_times: None,
        demographic_filters: Vec::new(),
        blacklists: Vec::new(),
        whitelists: Vec::new(),
        platform: PlatformFilter::default(),
    }
}

/// 2026-05-04 10:00, a Monday.
pub(crate) fn monday_morning() -> NaiveDateTime {
    NaiveDateTime::parse_from_str("2026-05-04 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
}

/// Session store backed by a plain map.
#[derive(Default)]
pub(crate) struct MemorySessions(Mutex<HashMap<String, SessionContext>>);

#[async_trait]
impl SessionStore for MemorySessions {
    async fn load(&self, id: &str) -> Result<SessionContext> {
        Ok(self.0.lock().unwrap().get(id).cloned().unwrap_or_else(|| SessionContext::new(id)))
    }

    async fn save(&self, s: &SessionContext) -> Result<()> {
        self.0.lock().unwrap().insert(s.session_id.clone(), s.clone());
        Ok(())
    }
}

pub(crate) fn sessions() -> Arc<SessionService> {
    Arc::new(SessionService::new(Arc::new(MemorySessions::default())))
}
