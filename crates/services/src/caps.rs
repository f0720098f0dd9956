//! Offer cap enforcement against externally owned event counters.

use std::sync::Arc;

use chrono::NaiveDateTime;
use domains::errors::Result;
use domains::models::Offer;
use domains::ports::CapCounter;
use tracing::debug;

pub struct OfferCapTracker {
    counter: Arc<dyn CapCounter>,
}

impl OfferCapTracker {
    pub fn new(counter: Arc<dyn CapCounter>) -> Self {
        Self { counter }
    }

    /// False once the offer has reached its daily (calendar day) or total cap.
    /// Zero or unset caps are not enforced.
    pub async fn under_cap(&self, offer: &Offer, now: NaiveDateTime) -> Result<bool> {
        let Some(caps) = offer.active_times.as_ref() else {
            return Ok(true);
        };

        if let Some(cap) = caps.daily_cap.filter(|c| *c > 0) {
            let start_of_day = now.date().and_hms_opt(0, 0, 0).unwrap_or(now);
            let today = self.counter.count_events(offer.offer_ref(), Some(start_of_day)).await?;
            if today >= cap {
                debug!(offer = %offer.offer_ref(), count = today, cap, "daily cap reached");
                return Ok(false);
            }
        }

        if let Some(cap) = caps.total_cap.filter(|c| *c > 0) {
            let total = self.counter.count_events(offer.offer_ref(), None).await?;
            if total >= cap {
                debug!(offer = %offer.offer_ref(), count = total, cap, "total cap reached");
                return Ok(false);
            }
        }

        Ok(true)
    }
}
