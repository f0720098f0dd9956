//! Blacklist and whitelist filtering.

use domains::models::ListRule;

use crate::attributes::{self, EvaluationContext};

/// Rules on this field match against first or last name.
pub const NAME_FIELD: &str = "name";

/// No blacklist rule may match; when whitelist rules exist at least one must.
pub fn passes_lists(
    blacklists: &[ListRule],
    whitelists: &[ListRule],
    ctx: &EvaluationContext<'_>,
) -> bool {
    if blacklists.iter().any(|rule| rule_matches(rule, ctx)) {
        return false;
    }
    whitelists.is_empty() || whitelists.iter().any(|rule| rule_matches(rule, ctx))
}

/// Case-insensitive exact match of any listed value. An absent attribute
/// compares as the empty string.
pub fn rule_matches(rule: &ListRule, ctx: &EvaluationContext<'_>) -> bool {
    if rule.field == NAME_FIELD {
        let first = ctx.visitor.get("first_name").unwrap_or_default().to_lowercase();
        let last = ctx.visitor.get("last_name").unwrap_or_default().to_lowercase();
        return rule.normalized_values().any(|v| v == first || v == last);
    }

    let actual = attributes::resolve(ctx, &rule.field)
        .map(|a| a.as_text().to_lowercase())
        .unwrap_or_default();
    rule.normalized_values().any(|v| v == actual)
}
