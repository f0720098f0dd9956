//! # Eligibility Engine
//!
//! Composes the temporal gate, demographic filters and list filters into a
//! single admit/reject decision per offer. Pure: no I/O, no shared state.

use domains::models::Offer;
use tracing::debug;

use crate::attributes::EvaluationContext;
use crate::lists;
use crate::predicate::{self, SubstringMatch};
use crate::temporal;

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    pub substring_match: SubstringMatch,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EligibilityEngine {
    options: EngineOptions,
}

impl EligibilityEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }

    /// Enabled flag, then temporal gate, demographic filters and lists.
    pub fn is_eligible(&self, offer: &Offer, ctx: &EvaluationContext<'_>) -> bool {
        if !offer.enabled {
            debug!(offer = %offer.offer_ref(), "rejected: disabled");
            return false;
        }
        self.passes_filters(offer, ctx)
    }

    /// Every filter stage, without the enabled check.
    pub fn passes_filters(&self, offer: &Offer, ctx: &EvaluationContext<'_>) -> bool {
        let offer_ref = offer.offer_ref();

        if !temporal::passes_temporal_gate(offer.active_times.as_ref(), ctx.now) {
            debug!(offer = %offer_ref, "rejected: outside active times");
            return false;
        }

        if let Some(failed) = offer
            .demographic_filters
            .iter()
            .find(|f| !predicate::evaluate(f, ctx, self.options.substring_match))
        {
            debug!(
                offer = %offer_ref,
                field = %failed.field,
                operator = %failed.operator,
                "rejected: demographic filter"
            );
            return false;
        }

        if !lists::passes_lists(&offer.blacklists, &offer.whitelists, ctx) {
            debug!(offer = %offer_ref, "rejected: blacklist/whitelist");
            return false;
        }

        true
    }
}
