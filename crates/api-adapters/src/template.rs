//! # Pixel Template Renderer
//!
//! Pixel code is stored as HTML in Twig/Jinja syntax and rendered at request
//! time with `minijinja`, e.g.
//! `<img src="https://t.example/p?v={{ revenue }}&e={{ user_data.email | url_encode }}">`.
//!
//! Output is HTML-escaped unless marked `raw`. Missing values, including
//! lookups through missing objects, render as an empty string. Besides the
//! minijinja builtins the environment registers the Twig filters pixel
//! code relies on: `url_encode`, `raw`, `number_format` and a Twig-style
//! `default` that also replaces empty strings.

use domains::errors::{DomainError, Result};
use domains::ports::TemplateRenderer;
use minijinja::value::ValueKind;
use minijinja::{AutoEscape, Environment, Error, ErrorKind, UndefinedBehavior, Value};
use serde_json::Value as Json;

const TEMPLATE_NAME: &str = "pixel.html";

pub struct PixelTemplateRenderer {
    env: Environment<'static>,
}

impl PixelTemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.add_filter("url_encode", url_encode);
        env.add_filter("raw", raw);
        env.add_filter("number_format", number_format);
        env.add_filter("default", default);
        Self { env }
    }
}

impl Default for PixelTemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for PixelTemplateRenderer {
    fn render(&self, template: &str, context: &Json) -> Result<String> {
        self.env
            .render_named_str(TEMPLATE_NAME, template, normalize(context))
            .map_err(|e| DomainError::Render(e.to_string()))
    }
}

/// Whole-number floats print without a fractional part and booleans print
/// as `1` or nothing.
fn normalize(value: &Json) -> Json {
    match value {
        Json::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => Json::from(f as i64),
            _ => value.clone(),
        },
        Json::Bool(true) => Json::from("1"),
        Json::Bool(false) => Json::from(""),
        Json::Array(items) => Json::Array(items.iter().map(normalize).collect()),
        Json::Object(map) => {
            Json::Object(map.iter().map(|(k, v)| (k.clone(), normalize(v))).collect())
        }
        other => other.clone(),
    }
}

fn text_of(value: &Value) -> String {
    if value.is_undefined() || value.is_none() {
        return String::new();
    }
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// RFC 3986 encoding: spaces become `%20`.
fn url_encode(value: Value) -> Value {
    let encoded: String =
        url::form_urlencoded::byte_serialize(text_of(&value).as_bytes()).collect();
    Value::from_safe_string(encoded.replace('+', "%20"))
}

fn raw(value: Value) -> Value {
    Value::from_safe_string(text_of(&value))
}

fn default(value: Value, fallback: Option<Value>) -> Value {
    let empty = value.is_undefined()
        || value.is_none()
        || value.as_str() == Some("")
        || (matches!(value.kind(), ValueKind::Seq | ValueKind::Map) && value.len() == Some(0));
    if empty {
        fallback.unwrap_or_else(|| Value::from(""))
    } else {
        value
    }
}

fn number_format(
    value: Value,
    decimals: Option<usize>,
    dec_point: Option<String>,
    thousands_sep: Option<String>,
) -> std::result::Result<String, Error> {
    let number = if value.is_undefined() || value.is_none() {
        0.0
    } else if let Some(s) = value.as_str() {
        s.trim().parse::<f64>().map_err(|_| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("number_format expects a number, got {s:?}"),
            )
        })?
    } else {
        f64::try_from(value)?
    };

    let decimals = decimals.unwrap_or(0);
    let scale = 10f64.powi(decimals as i32);
    let rounded = (number * scale).round() / scale;
    let fixed = format!("{:.*}", decimals, rounded.abs());
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));

    let sep = thousands_sep.as_deref().unwrap_or(",");
    let mut out = String::with_capacity(fixed.len() + whole.len() / 3);
    if rounded < 0.0 {
        out.push('-');
    }
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            out.push_str(sep);
        }
        out.push(digit);
    }
    if !fraction.is_empty() {
        out.push_str(dec_point.as_deref().unwrap_or("."));
        out.push_str(fraction);
    }
    Ok(out)
}
