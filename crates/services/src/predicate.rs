//! Demographic filter evaluation.
//!
//! Comparisons run on values as typed: derived numbers (age) compare
//! numerically against numeric filter values, visitor-entered text compares
//! byte-wise. `between` on `age` is the one place both sides are parsed as
//! floats.

use std::cmp::Ordering;

use domains::models::{DemographicFilter, FilterOperator};
use serde::Deserialize;
use tracing::debug;

use crate::attributes::{self, AttrValue, EvaluationContext};

/// How `has`/`has-not` decide whether a filter value occurs in the attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstringMatch {
    /// Production behavior: a match at the very start of the attribute is
    /// reported as no match.
    #[default]
    Legacy,
    /// Any occurrence counts.
    Standard,
}

/// Evaluates one filter. Blank filters pass; an absent attribute fails.
pub fn evaluate(
    filter: &DemographicFilter,
    ctx: &EvaluationContext<'_>,
    mode: SubstringMatch,
) -> bool {
    if filter.is_blank() {
        return true;
    }

    let Some(actual) = attributes::resolve(ctx, &filter.field) else {
        debug!(field = %filter.field, "attribute absent, filter fails");
        return false;
    };

    // Operators outside the known set are not enforced.
    let Some(operator) = FilterOperator::parse(&filter.operator) else {
        debug!(operator = %filter.operator, "unknown filter operator skipped");
        return true;
    };

    let expected = filter.value.as_str();
    match operator {
        FilterOperator::Eq => compare(&actual, expected) == Ordering::Equal,
        FilterOperator::Neq => compare(&actual, expected) != Ordering::Equal,
        FilterOperator::Lt => compare(&actual, expected) == Ordering::Less,
        FilterOperator::Lte => compare(&actual, expected) != Ordering::Greater,
        FilterOperator::Gt => compare(&actual, expected) == Ordering::Greater,
        FilterOperator::Gte => compare(&actual, expected) != Ordering::Less,
        FilterOperator::In => list(expected).contains(&actual.as_text().to_lowercase()),
        FilterOperator::NotIn => !list(expected).contains(&actual.as_text().to_lowercase()),
        FilterOperator::Has => {
            let haystack = actual.as_text();
            list(expected).iter().any(|needle| substring_hit(&haystack, needle, mode))
        }
        FilterOperator::HasNot => {
            let haystack = actual.as_text();
            !list(expected).iter().any(|needle| substring_hit(&haystack, needle, mode))
        }
        FilterOperator::Between => between(&filter.field, &actual, expected),
    }
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',').map(|v| v.trim().to_lowercase()).collect()
}

/// Case-insensitive substring test. Empty needles never match.
pub fn substring_hit(haystack: &str, needle: &str, mode: SubstringMatch) -> bool {
    let haystack = haystack.to_lowercase();
    let needle = needle.to_lowercase();
    if needle.is_empty() {
        return false;
    }
    match mode {
        SubstringMatch::Legacy => haystack.find(&needle).is_some_and(|pos| pos > 0),
        SubstringMatch::Standard => haystack.contains(&needle),
    }
}

fn between(field: &str, actual: &AttrValue, expected: &str) -> bool {
    let bounds = list(expected);
    let [low, high] = bounds.as_slice() else {
        return false;
    };

    if field == attributes::AGE {
        let value = lenient_float(&actual.as_text());
        value >= lenient_float(low) && value <= lenient_float(high)
    } else {
        compare(actual, low) != Ordering::Less && compare(actual, high) != Ordering::Greater
    }
}

/// Orders `actual` against a filter operand.
fn compare(actual: &AttrValue, expected: &str) -> Ordering {
    match actual {
        AttrValue::Number(n) => match expected.trim().parse::<f64>() {
            Ok(e) => (*n as f64).partial_cmp(&e).unwrap_or(Ordering::Equal),
            Err(_) => n.to_string().as_str().cmp(expected),
        },
        AttrValue::Text(s) => s.as_str().cmp(expected),
        AttrValue::Flag(b) => b.cmp(&!(expected.is_empty() || expected == "0")),
    }
}

/// Float parse that reads unparseable input as zero.
fn lenient_float(raw: &str) -> f64 {
    raw.trim().parse().unwrap_or(0.0)
}
