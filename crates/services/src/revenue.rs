//! # Revenue Bucket Allocator
//!
//! CPA partner pixels are paid out of the revenue a session has earned so
//! far. Pixels are considered in listing order; each one that the remaining
//! balance can cover fires and debits its amount. Pixels that cannot be
//! covered are skipped and later, cheaper ones may still fire.

use domains::models::Pixel;

#[derive(Debug, Clone, PartialEq)]
pub struct BucketAllocation<'a> {
    /// Pixels that fire, with the amount each consumed.
    pub fired: Vec<(&'a Pixel, f64)>,
    pub balance: f64,
}

/// Greedy single pass over `pixels`. Non-partner pixels and pixels without
/// a CPA amount are ignored. The balance never goes negative.
pub fn allocate(bucket: f64, pixels: &[Pixel]) -> BucketAllocation<'_> {
    let mut balance = bucket;
    let mut fired = Vec::new();

    for pixel in pixels.iter().filter(|p| p.is_cpa_partner) {
        let Some(amount) = pixel.cpa_amount() else {
            continue;
        };
        if amount <= balance {
            balance -= amount;
            fired.push((pixel, amount));
        }
    }

    BucketAllocation { fired, balance }
}
