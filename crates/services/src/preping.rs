//! # Pre-Ping Fan-Out Coordinator
//!
//! Fires every offer's verification call concurrently and waits for all of
//! them to settle. A call that fails, times out or answers with a non-2xx
//! status only excludes its own offer; it never fails the batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use domains::models::{HttpMethod, Offer, OfferRef, PrePingConfig, UrlParam};
use domains::ports::{HttpClient, OutboundRequest, RequestBody};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::attributes::{self, EvaluationContext};

/// Settled result of one verification call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrePingOutcome {
    /// 2xx response with this body.
    Fulfilled(String),
    /// Transport failure, timeout or non-2xx status.
    Rejected(String),
}

impl PrePingOutcome {
    pub fn is_positive(&self, config: &PrePingConfig) -> bool {
        match self {
            PrePingOutcome::Fulfilled(body) => config.is_positive(body),
            PrePingOutcome::Rejected(_) => false,
        }
    }
}

pub struct PrePingCoordinator {
    http: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl PrePingCoordinator {
    pub fn new(http: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// Offers whose verification call came back positive, in input order.
    /// Offers without an enabled pre-ping config are ignored.
    pub async fn resolve(&self, offers: Vec<Offer>, ctx: &EvaluationContext<'_>) -> Vec<Offer> {
        let outcomes = self.settle(&offers, ctx).await;

        offers
            .into_iter()
            .filter(|offer| {
                let (Some(config), Some(outcome)) =
                    (offer.pre_ping.as_ref(), outcomes.get(&offer.offer_ref()))
                else {
                    return false;
                };
                let positive = outcome.is_positive(config);
                debug!(offer = %offer.offer_ref(), positive, "pre-ping settled");
                positive
            })
            .collect()
    }

    /// Launches one call per pre-ping offer and joins them all.
    pub async fn settle(
        &self,
        offers: &[Offer],
        ctx: &EvaluationContext<'_>,
    ) -> HashMap<OfferRef, PrePingOutcome> {
        let started = Instant::now();
        let mut outcomes = HashMap::new();
        let mut calls = JoinSet::new();

        for offer in offers {
            let Some(config) = offer.pre_ping.as_ref().filter(|c| c.enabled) else {
                continue;
            };
            let offer_ref = offer.offer_ref();
            let request = build_request(config, ctx, self.timeout);
            let http = Arc::clone(&self.http);
            let ceiling = self.timeout;

            // Replaced when the task reports; stays if the task itself dies.
            outcomes.insert(offer_ref, PrePingOutcome::Rejected("task aborted".into()));
            calls.spawn(async move {
                let outcome = match tokio::time::timeout(ceiling, http.execute(request)).await {
                    Ok(Ok(response)) if response.is_success() => {
                        PrePingOutcome::Fulfilled(response.body)
                    }
                    Ok(Ok(response)) => {
                        PrePingOutcome::Rejected(format!("status {}", response.status))
                    }
                    Ok(Err(e)) => PrePingOutcome::Rejected(e.to_string()),
                    Err(_) => PrePingOutcome::Rejected("timed out".into()),
                };
                (offer_ref, outcome)
            });
        }

        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((offer_ref, outcome)) => {
                    if let PrePingOutcome::Rejected(reason) = &outcome {
                        warn!(offer = %offer_ref, %reason, "pre-ping call failed");
                    }
                    outcomes.insert(offer_ref, outcome);
                }
                Err(e) => warn!(error = %e, "pre-ping task panicked"),
            }
        }

        info!(
            calls = outcomes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pre-ping fan-out settled"
        );
        outcomes
    }

    /// One-off call used to try a configuration out. Returns the body, or an
    /// empty string on any failure.
    pub async fn test_call(
        &self,
        url: &str,
        method: HttpMethod,
        params: Vec<(String, String)>,
        timeout: Duration,
    ) -> String {
        let request = OutboundRequest {
            method,
            url: url.to_string(),
            body: body_for(method, params),
            headers: Vec::new(),
            timeout,
        };
        match tokio::time::timeout(timeout, self.http.execute(request)).await {
            Ok(Ok(response)) if response.is_success() => response.body,
            Ok(Ok(response)) => {
                debug!(status = response.status, "test pre-ping returned error status");
                String::new()
            }
            Ok(Err(e)) => {
                debug!(error = %e, "test pre-ping failed");
                String::new()
            }
            Err(_) => String::new(),
        }
    }
}

fn body_for(method: HttpMethod, params: Vec<(String, String)>) -> RequestBody {
    match method {
        HttpMethod::Get => RequestBody::Query(params),
        HttpMethod::Post => RequestBody::Form(params),
    }
}

/// Builds the outbound call for one config: GET sends query parameters,
/// POST sends a form body.
pub fn build_request(
    config: &PrePingConfig,
    ctx: &EvaluationContext<'_>,
    timeout: Duration,
) -> OutboundRequest {
    let params = config
        .url_params
        .iter()
        .filter(|p| !p.client_field.is_empty())
        .map(|p| (p.client_field.clone(), param_value(p, ctx)))
        .collect();

    OutboundRequest {
        method: config.method,
        url: config.url.clone(),
        body: body_for(config.method, params),
        headers: Vec::new(),
        timeout,
    }
}

/// A non-empty `format_or_value` is sent literally; otherwise the visitor
/// attribute, or an empty string when absent.
pub(crate) fn param_text(param: &UrlParam, ctx: &EvaluationContext<'_>) -> String {
    match param.format_or_value.as_deref().filter(|v| !v.is_empty()) {
        Some(literal) => literal.to_string(),
        None => attributes::resolve(ctx, &param.field)
            .map(|v| v.as_text().into_owned())
            .unwrap_or_default(),
    }
}

fn param_value(param: &UrlParam, ctx: &EvaluationContext<'_>) -> String {
    let raw = param_text(param, ctx);
    if param.url_encode {
        url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
    } else {
        raw
    }
}
