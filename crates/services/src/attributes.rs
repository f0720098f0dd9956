//! Attribute resolution: looks up a named visitor attribute, handling field
//! synonyms and derived values.

use std::borrow::Cow;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use domains::models::VisitorData;

/// Everything rule evaluation reads for one visitor request. Built once per
/// request; evaluation against it is synchronous and side-effect free.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub visitor: &'a VisitorData,
    /// Cached verification result for the visitor's email, prefetched.
    pub email_verified: Option<bool>,
    pub now: NaiveDateTime,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(visitor: &'a VisitorData, now: NaiveDateTime) -> Self {
        Self {
            visitor,
            email_verified: None,
            now,
        }
    }

    pub fn with_email_verified(mut self, verified: Option<bool>) -> Self {
        self.email_verified = verified;
        self
    }
}

/// A resolved attribute. Absence is modelled as `None` by [`resolve`], never
/// as a variant here.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Number(i64),
    Flag(bool),
}

impl AttrValue {
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            AttrValue::Text(s) => Cow::Borrowed(s),
            AttrValue::Number(n) => Cow::Owned(n.to_string()),
            AttrValue::Flag(true) => Cow::Borrowed("1"),
            AttrValue::Flag(false) => Cow::Borrowed(""),
        }
    }
}

pub const AGE: &str = "age";
pub const ZIP_CODE: &str = "zip_code";
pub const BRITE_VERIFY_VALID: &str = "brite_verify_valid";

/// Resolves `field` for the visitor in `ctx`.
pub fn resolve(ctx: &EvaluationContext<'_>, field: &str) -> Option<AttrValue> {
    match field {
        AGE => age(ctx.visitor, ctx.now).map(AttrValue::Number),
        ZIP_CODE => ctx
            .visitor
            .get(ZIP_CODE)
            .or_else(|| ctx.visitor.get("zip"))
            .map(|z| AttrValue::Text(z.to_string())),
        BRITE_VERIFY_VALID => match ctx.email_verified {
            Some(true) => Some(AttrValue::Flag(true)),
            _ => None,
        },
        other => ctx.visitor.get(other).map(|v| AttrValue::Text(v.to_string())),
    }
}

/// Age by calendar year only: `current year - birth year`. Month and day are
/// ignored, so the result runs one year high until the birthday passes.
pub fn age(visitor: &VisitorData, now: NaiveDateTime) -> Option<i64> {
    let birth_year = match visitor.get("birthday").and_then(birth_year) {
        Some(year) => year,
        None => visitor.get("year")?.trim().parse::<i64>().ok()?,
    };
    Some(i64::from(now.year()) - birth_year)
}

fn birth_year(raw: &str) -> Option<i64> {
    const FORMATS: [&str; 4] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y"];

    let trimmed = raw.trim();
    let date_part = trimmed.split(['T', ' ']).next().unwrap_or(trimmed);
    FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(date_part, f).ok())
        .map(|d| i64::from(d.year()))
}
