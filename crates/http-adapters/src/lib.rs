//! Outbound HTTP for pre-pings and lead posting, backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use domains::errors::TransportError;
use domains::models::HttpMethod;
use domains::ports::{HttpClient, HttpResponse, OutboundRequest, RequestBody};
use tracing::debug;

/// Shares one connection pool across every outbound call.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

fn transport_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError> {
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        let builder = request
            .headers
            .iter()
            .fold(builder, |b, (name, value)| b.header(name.as_str(), value.as_str()));
        let builder = match &request.body {
            RequestBody::Query(params) => builder.query(params),
            RequestBody::Form(params) => builder.form(params),
            RequestBody::Json(value) => builder.json(value),
        };

        let response = builder
            .timeout(request.timeout)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;
        debug!(url = %request.url, status, bytes = body.len(), "outbound call completed");

        Ok(HttpResponse { status, body })
    }
}
