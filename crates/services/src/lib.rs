//! Offer eligibility and selection engine.
//!
//! Pure rule evaluation lives in [`attributes`], [`predicate`], [`temporal`],
//! [`lists`] and [`eligibility`]. The remaining modules are application
//! services that combine it with the ports from `domains`.

pub mod attributes;
pub mod caps;
pub mod eligibility;
pub mod leads;
pub mod lists;
pub mod offers;
pub mod pixels;
pub mod predicate;
pub mod preping;
pub mod revenue;
pub mod sessions;
pub mod temporal;
pub mod tracking;

#[cfg(test)]
mod fixtures;

pub use caps::OfferCapTracker;
pub use eligibility::{EligibilityEngine, EngineOptions};
pub use leads::{LeadDispatcher, LeadOutcome, LeadSubmission};
pub use offers::{ConfirmedOffers, EvaluatedOffers, OfferService, OfferSummary, PendingOffer};
pub use pixels::{PixelAllocation, PixelRequest, PixelService, RenderedPixel};
pub use predicate::SubstringMatch;
pub use preping::{PrePingCoordinator, PrePingOutcome};
pub use sessions::SessionService;
pub use tracking::{ClickOutcome, ClickRequest, ConversionTracker, CpaCompletion, SkipRequest};
