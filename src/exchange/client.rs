//! Upbit REST API client.

use crate::config::UpbitConfig;
use crate::exchange::error::ExchangeError;
use crate::exchange::traits::{MarketDataProvider, OrderPlacer, WalletProvider};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const BASE_URL: &str = "https://api.upbit.com";

/// Upbit API client for market data, accounts, and orders.
pub struct UpbitClient {
    http: Client,
    access_key: String,
    secret_key: String,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl UpbitClient {
    /// Create a new Upbit client from configuration.
    pub fn new(config: &UpbitConfig) -> Result<Self> {
        Self::with_base_url(config, BASE_URL)
    }

    /// Create a client against a custom endpoint.
    pub fn with_base_url(config: &UpbitConfig, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    /// Build an HS256 JWT for authenticated requests.
    ///
    /// When `query` is present its SHA-512 hash is embedded so the server can
    /// verify the parameters were not altered.
    fn bearer_token(&self, query: Option<&str>) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);

        let mut claims = serde_json::Map::new();
        claims.insert("access_key".into(), self.access_key.clone().into());
        claims.insert("nonce".into(), uuid::Uuid::new_v4().to_string().into());
        if let Some(query) = query {
            let hash = hex::encode(Sha512::digest(query.as_bytes()));
            claims.insert("query_hash".into(), hash.into());
            claims.insert("query_hash_alg".into(), "SHA512".into());
        }
        let payload = URL_SAFE_NO_PAD.encode(serde_json::Value::Object(claims).to_string());

        let signing_input = format!("{}.{}", header, payload);
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        format!("Bearer {}.{}", signing_input, signature)
    }

    fn query_string(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Send a request, retrying on HTTP 429 with a fixed delay.
    ///
    /// `build` is invoked per attempt so every attempt carries a fresh nonce.
    async fn send_with_retry<F>(&self, endpoint: &str, build: F) -> Result<Response, ExchangeError>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempts = self.max_retries + 1;
        for attempt in 1..=attempts {
            let response = build().send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }
            debug!(endpoint, attempt, "Rate limited, retrying");
            tokio::time::sleep(self.retry_delay).await;
        }

        warn!(endpoint, attempts, "Rate limit retries exhausted");
        Err(ExchangeError::RateLimited {
            endpoint: endpoint.to_string(),
            attempts,
        })
    }

    /// Decode a success body or map an error body to `ExchangeError::Api`.
    async fn decode<T: DeserializeOwned>(
        endpoint: &str,
        response: Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }

        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(error) => Err(error.into()),
            Err(_) => Err(ExchangeError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    // ==================== Market Data (Public) ====================

    /// Get every listed market.
    #[instrument(skip(self))]
    pub async fn get_markets(&self) -> Result<Vec<MarketInfo>, ExchangeError> {
        let endpoint = "/v1/market/all";
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.send_with_retry(endpoint, || self.http.get(&url)).await?;
        Self::decode(endpoint, response).await
    }

    /// Get the most recent one-minute candles, newest first as delivered.
    #[instrument(skip(self))]
    pub async fn get_minute_candles(
        &self,
        market: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let endpoint = "/v1/candles/minutes/1";
        let query = Self::query_string(&[("market", market.to_string()), ("count", count.to_string())]);
        let url = format!("{}{}?{}", self.base_url, endpoint, query);
        let response = self.send_with_retry(endpoint, || self.http.get(&url)).await?;
        Self::decode(endpoint, response).await
    }

    // ==================== Account (Authenticated) ====================

    /// Get all account balances.
    #[instrument(skip(self))]
    pub async fn get_accounts(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        let endpoint = "/v1/accounts";
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .send_with_retry(endpoint, || {
                self.http
                    .get(&url)
                    .header("Authorization", self.bearer_token(None))
            })
            .await?;
        Self::decode(endpoint, response).await
    }

    // ==================== Orders (Authenticated) ====================

    /// Place a market order.
    #[instrument(skip(self))]
    pub async fn place_order(&self, order: &MarketOrder) -> Result<OrderResponse, ExchangeError> {
        let endpoint = "/v1/orders";
        let params = order.params();
        let query = Self::query_string(&params);
        let body: serde_json::Map<String, serde_json::Value> = params
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
            .collect();
        let url = format!("{}{}", self.base_url, endpoint);

        debug!("Placing market order: {:?}", order);

        let response = self
            .send_with_retry(endpoint, || {
                self.http
                    .post(&url)
                    .header("Authorization", self.bearer_token(Some(&query)))
                    .json(&body)
            })
            .await?;
        Self::decode(endpoint, response).await
    }
}

#[async_trait]
impl MarketDataProvider for UpbitClient {
    async fn list_markets(&self) -> Result<Vec<String>, ExchangeError> {
        Ok(self
            .get_markets()
            .await?
            .into_iter()
            .filter(MarketInfo::is_krw)
            .map(|m| m.market)
            .collect())
    }

    async fn minute_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>, ExchangeError> {
        let candles = self.get_minute_candles(symbol, count).await?;
        if candles.len() < count {
            return Err(ExchangeError::InsufficientHistory {
                requested: count,
                received: candles.len(),
            });
        }
        // Delivered newest first
        Ok(candles.iter().rev().map(Bar::from).collect())
    }
}

#[async_trait]
impl OrderPlacer for UpbitClient {
    async fn place_market_order(
        &self,
        order: &MarketOrder,
    ) -> Result<OrderResponse, ExchangeError> {
        let response = self.place_order(order).await?;
        // The order was accepted either way; an odd echo is only logged
        match response.order_side() {
            Ok(side) if side == order.side => {}
            Ok(_) => {
                warn!(market = %order.market, side = %response.side, "Order side mismatch in response");
            }
            Err(e) => {
                warn!(market = %order.market, error = %e, "Unrecognized order side in response");
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl WalletProvider for UpbitClient {
    async fn positions(&self) -> Result<HashMap<String, WalletPosition>, ExchangeError> {
        Ok(self
            .get_accounts()
            .await?
            .into_iter()
            .filter_map(|account| {
                account.market().map(|market| {
                    (
                        market,
                        WalletPosition {
                            avg_buy_price: account.avg_buy_price,
                            quantity: account.balance,
                        },
                    )
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> UpbitConfig {
        UpbitConfig {
            access_key: "access".to_string(),
            secret_key: "secret".to_string(),
            max_retries: 2,
            retry_delay_ms: 1,
        }
    }

    fn candles_json(count: usize) -> serde_json::Value {
        // Newest first, closes count down from 100 + count
        let candles: Vec<_> = (0..count)
            .map(|i| {
                serde_json::json!({
                    "market": "KRW-BTC",
                    "candle_date_time_kst": format!("2024-05-01T09:{:02}:00", i % 60),
                    "trade_price": 100 + count - i,
                    "candle_acc_trade_volume": 1.5
                })
            })
            .collect();
        serde_json::Value::Array(candles)
    }

    #[test]
    fn test_bearer_token_shape() {
        let client = UpbitClient::new(&test_config()).unwrap();
        let token = client.bearer_token(Some("market=KRW-BTC"));
        let jwt = token.strip_prefix("Bearer ").unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["access_key"], "access");
        assert_eq!(claims["query_hash_alg"], "SHA512");
        assert_eq!(claims["query_hash"].as_str().unwrap().len(), 128);
    }

    #[tokio::test]
    async fn test_minute_bars_reversed_to_oldest_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/candles/minutes/1"))
            .and(query_param("market", "KRW-BTC"))
            .and(query_param("count", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(candles_json(3)))
            .mount(&server)
            .await;

        let client = UpbitClient::with_base_url(&test_config(), &server.uri()).unwrap();
        let bars = client.minute_bars("KRW-BTC", 3).await.unwrap();

        let closes: Vec<_> = bars.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![dec!(101), dec!(102), dec!(103)]);
    }

    #[tokio::test]
    async fn test_short_window_is_insufficient_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/candles/minutes/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(candles_json(101)))
            .mount(&server)
            .await;

        let client = UpbitClient::with_base_url(&test_config(), &server.uri()).unwrap();
        let err = client.minute_bars("KRW-BTC", 102).await.unwrap_err();

        assert!(matches!(
            err,
            ExchangeError::InsufficientHistory {
                requested: 102,
                received: 101
            }
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/market/all"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = UpbitClient::with_base_url(&test_config(), &server.uri()).unwrap();
        let err = client.list_markets().await.unwrap_err();

        assert!(matches!(err, ExchangeError::RateLimited { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_order_error_payload_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"name": "insufficient_funds_bid", "message": "주문가능한 금액(KRW)이 부족합니다."}
            })))
            .mount(&server)
            .await;

        let client = UpbitClient::with_base_url(&test_config(), &server.uri()).unwrap();
        let err = client
            .place_market_order(&MarketOrder::buy("KRW-BTC", dec!(10000)))
            .await
            .unwrap_err();

        match err {
            ExchangeError::Api { name, .. } => assert_eq!(name, "insufficient_funds_bid"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accepted_order_with_unknown_side_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "uuid": "9ca023a5-851b-4fec-9f0a-48cd83c2eaae",
                "side": "buy",
                "ord_type": "price",
                "market": "KRW-BTC",
                "state": "wait"
            })))
            .mount(&server)
            .await;

        let client = UpbitClient::with_base_url(&test_config(), &server.uri()).unwrap();
        let response = client
            .place_market_order(&MarketOrder::buy("KRW-BTC", dec!(10000)))
            .await
            .unwrap();

        assert_eq!(response.uuid, "9ca023a5-851b-4fec-9f0a-48cd83c2eaae");
        assert!(response.order_side().is_err());
    }

    #[tokio::test]
    async fn test_positions_exclude_quote_currency() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"currency": "KRW", "balance": "100000", "locked": "0", "avg_buy_price": "0", "unit_currency": "KRW"},
                {"currency": "XRP", "balance": "12.5", "locked": "0", "avg_buy_price": "800", "unit_currency": "KRW"}
            ])))
            .mount(&server)
            .await;

        let client = UpbitClient::with_base_url(&test_config(), &server.uri()).unwrap();
        let positions = client.positions().await.unwrap();

        assert_eq!(positions.len(), 1);
        let xrp = positions.get("KRW-XRP").unwrap();
        assert_eq!(xrp.avg_buy_price, dec!(800));
        assert_eq!(xrp.quantity, dec!(12.5));
    }
}
