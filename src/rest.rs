//! REST client for the Backpack API
//!
//! Public endpoints (markets, depth) are plain GETs. Private endpoints are
//! signed per call with a fresh timestamp; GET parameters go in the query
//! string, everything else in a JSON body built from the signed parameters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result, DEFAULT_RATE_LIMIT_DELAY};
use crate::orders::OrderRequest;
use crate::parser::{Balance, MarketInfo, OrderBookSnapshot, OrderResponse};
use crate::rate_limit::RateLimiter;
use crate::signing::{canonical_parameters, params_to_json, Instruction, ParamValue, Params, RequestSigner};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where order book snapshots come from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<OrderBookSnapshot>;
}

/// Order placement and cancellation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn execute_order(&self, request: &OrderRequest, client_id: u32) -> Result<OrderResponse>;
    async fn cancel_order(&self, symbol: &str, client_id: u32) -> Result<OrderResponse>;
}

pub struct RestClient {
    http: Client,
    base_url: String,
    signer: Option<Arc<RequestSigner>>,
    window_ms: u64,
    limiter: RateLimiter,
}

impl RestClient {
    pub fn new(
        base_url: &str,
        signer: Option<Arc<RequestSigner>>,
        window_ms: u64,
        rate_limit_per_sec: u32,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConnectorError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
            window_ms,
            limiter: RateLimiter::new(rate_limit_per_sec),
        })
    }

    pub async fn markets(&self) -> Result<Vec<MarketInfo>> {
        self.public_get("/markets", &[]).await
    }

    pub async fn depth(&self, symbol: &str) -> Result<OrderBookSnapshot> {
        info!(symbol = %symbol, "Fetching order book snapshot");
        self.public_get("/depth", &[("symbol", symbol.to_string())]).await
    }

    pub async fn balances(&self) -> Result<HashMap<String, Balance>> {
        self.private_request(Method::GET, "/balances", Vec::new()).await
    }

    async fn public_get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.limiter.acquire(path).await;

        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "GET");
        let response = self.http.get(&url).query(query).send().await?;
        Self::handle_response(path, response).await
    }

    async fn private_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Params,
    ) -> Result<T> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            ConnectorError::Authentication(format!("{} {} requires credentials", method, path))
        })?;

        // timestamp is taken after the limiter wait
        self.limiter.acquire(path).await;
        let instruction = Instruction::for_request(&method, path);
        let signed = signer.sign_now(instruction, &params, self.window_ms)?;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url);
        for (name, value) in signed.headers(signer.api_key()) {
            request = request.header(name, value);
        }

        request = if method == Method::GET {
            // query carries exactly the signed canonical values
            request.query(&canonical_parameters(&params)?)
        } else {
            request.json(&params_to_json(&params)?)
        };

        debug!(method = %method, url = %url, instruction = instruction.as_str(), "Signed request");
        let response = request.send().await?;
        Self::handle_response(path, response).await
    }

    async fn handle_response<T: DeserializeOwned>(path: &str, response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        warn!(path, status = status.as_u16(), body = %body, "Request failed");

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectorError::Authentication(body),
            StatusCode::TOO_MANY_REQUESTS => ConnectorError::RateLimited {
                retry_after: retry_after.unwrap_or(DEFAULT_RATE_LIMIT_DELAY),
            },
            s if s.is_server_error() => {
                ConnectorError::TransientNetwork(format!("HTTP {}: {}", s.as_u16(), body))
            }
            s if path.starts_with("/order") => ConnectorError::OrderRejected {
                status: s.as_u16(),
                message: body,
            },
            s => ConnectorError::Protocol(format!("HTTP {} on {}: {}", s.as_u16(), path, body)),
        })
    }
}

#[async_trait]
impl SnapshotSource for RestClient {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<OrderBookSnapshot> {
        self.depth(symbol).await
    }
}

#[async_trait]
impl OrderGateway for RestClient {
    async fn execute_order(&self, request: &OrderRequest, client_id: u32) -> Result<OrderResponse> {
        let params = request.to_params(client_id)?;
        info!(client_id, symbol = %request.symbol, "Submitting order");
        self.private_request(Method::POST, "/order", params).await
    }

    async fn cancel_order(&self, symbol: &str, client_id: u32) -> Result<OrderResponse> {
        let params: Params = vec![
            ("clientId".to_string(), ParamValue::from(client_id)),
            ("symbol".to_string(), ParamValue::from(symbol)),
        ];
        info!(client_id, symbol = %symbol, "Cancelling order");
        self.private_request(Method::DELETE, "/order", params).await
    }
}
