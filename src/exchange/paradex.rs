//! Paradex REST API adapter.
//!
//! Exchanges API credentials for a short-lived JWT at authentication time
//! and sends it as a bearer token on every call. Protective orders are
//! flagged REDUCE_ONLY so they can never grow the position.

use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::traits::{ExchangeAdapter, Venue};
use crate::exchange::types::{Order, OrderHandle, OrderId, OrderKind, OrderStatus, Position, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

const API_URL: &str = "https://api.prod.paradex.trade/v1";
const MARKET: &str = "ETH-USD-PERP";

/// Paradex exchange client.
pub struct ParadexClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    market: String,
    /// JWT obtained by `authenticate`, refreshed on re-auth.
    token: RwLock<Option<String>>,
}

// ==================== Venue payload shapes ====================

#[derive(Debug, Deserialize)]
struct AuthResponse {
    jwt_token: String,
}

#[derive(Debug, Deserialize)]
struct ResultsEnvelope<T> {
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ParadexOrder {
    id: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    status: String,
    #[serde(with = "rust_decimal::serde::str")]
    size: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    trigger_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    filled_size: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    avg_fill_price: Option<Decimal>,
    created_at: i64,
}

#[derive(Debug, Deserialize)]
struct ParadexPosition {
    market: String,
    status: String,
    #[serde(with = "rust_decimal::serde::str")]
    size: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    average_entry_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    unrealized_pnl: Option<Decimal>,
}

impl ParadexClient {
    pub fn new(api_key: &str, api_secret: &str) -> ExchangeResult<Self> {
        Self::with_base_url(api_key, api_secret, API_URL)
    }

    /// Create a client against a custom base URL (tests).
    pub fn with_base_url(api_key: &str, api_secret: &str, base_url: &str) -> ExchangeResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            base_url: base_url.to_string(),
            market: MARKET.to_string(),
            token: RwLock::new(None),
        })
    }

    async fn bearer(&self) -> ExchangeResult<String> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| ExchangeError::Auth("not authenticated".into()))
    }

    async fn check_status(response: reqwest::Response) -> ExchangeResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Err(ExchangeError::Auth(format!("{}: {}", status, body))),
            400 | 422 => Err(ExchangeError::OrderRejected(body)),
            _ => Err(ExchangeError::Transport(format!("{}: {}", status, body))),
        }
    }

    fn side_param(side: Side) -> &'static str {
        match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    fn parse_side(raw: &str) -> ExchangeResult<Side> {
        match raw {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(ExchangeError::InvalidResponse(format!(
                "unknown side {other:?}"
            ))),
        }
    }

    fn parse_status(raw: &str) -> OrderStatus {
        match raw {
            "FILLED" | "CLOSED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            // NEW / OPEN / UNTRIGGERED
            _ => OrderStatus::Open,
        }
    }

    fn parse_kind(raw: &str) -> OrderKind {
        match raw {
            "LIMIT" | "TAKE_PROFIT_LIMIT" => OrderKind::Limit,
            "STOP_MARKET" | "STOP_LOSS_MARKET" => OrderKind::Stop,
            _ => OrderKind::Market,
        }
    }

    fn parse_timestamp(millis: i64) -> ExchangeResult<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            ExchangeError::InvalidResponse(format!("timestamp {millis} out of range"))
        })
    }

    fn to_canonical_order(raw: ParadexOrder) -> ExchangeResult<Order> {
        let created_at = Self::parse_timestamp(raw.created_at)?;
        Ok(Order {
            id: OrderId::new(raw.id),
            venue: Venue::Paradex,
            side: Self::parse_side(&raw.side)?,
            kind: Self::parse_kind(&raw.order_type),
            size: raw.size,
            price: raw.price,
            trigger_price: raw.trigger_price,
            status: Self::parse_status(&raw.status),
            executed_size: raw.filled_size.unwrap_or(Decimal::ZERO),
            created_at,
            last_seen_at: Utc::now(),
        })
    }

    async fn submit_order(&self, body: serde_json::Value) -> ExchangeResult<OrderHandle> {
        let token = self.bearer().await?;
        debug!(market = %self.market, "submitting Paradex order");

        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let raw: ParadexOrder = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        Ok(OrderHandle {
            id: OrderId::new(raw.id),
            status: Self::parse_status(&raw.status),
            executed_size: raw.filled_size.unwrap_or(Decimal::ZERO),
            avg_fill_price: raw.avg_fill_price.unwrap_or(Decimal::ZERO),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for ParadexClient {
    fn venue(&self) -> Venue {
        Venue::Paradex
    }

    #[instrument(skip(self))]
    async fn authenticate(&self) -> ExchangeResult<()> {
        let response = self
            .http
            .post(format!("{}/auth", self.base_url))
            .header("PARADEX-API-KEY", &self.api_key)
            .header("PARADEX-API-SECRET", &self.api_secret)
            .send()
            .await
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Auth(format!("{}: {}", status, body)));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Auth(format!("malformed auth response: {e}")))?;

        *self.token.write().await = Some(auth.jwt_token);
        debug!("Paradex JWT refreshed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn place_market_order(&self, side: Side, size: Decimal) -> ExchangeResult<OrderHandle> {
        self.submit_order(serde_json::json!({
            "market": self.market,
            "type": "MARKET",
            "side": Self::side_param(side),
            "size": size.to_string(),
        }))
        .await
    }

    #[instrument(skip(self))]
    async fn place_limit_order(
        &self,
        side: Side,
        size: Decimal,
        price: Decimal,
    ) -> ExchangeResult<OrderHandle> {
        self.submit_order(serde_json::json!({
            "market": self.market,
            "type": "LIMIT",
            "side": Self::side_param(side),
            "size": size.to_string(),
            "price": price.to_string(),
            "flags": ["REDUCE_ONLY"],
        }))
        .await
    }

    #[instrument(skip(self))]
    async fn place_stop_order(
        &self,
        side: Side,
        size: Decimal,
        trigger_price: Decimal,
    ) -> ExchangeResult<OrderHandle> {
        self.submit_order(serde_json::json!({
            "market": self.market,
            "type": "STOP_MARKET",
            "side": Self::side_param(side),
            "size": size.to_string(),
            "trigger_price": trigger_price.to_string(),
            "flags": ["REDUCE_ONLY"],
        }))
        .await
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, id: &OrderId) -> ExchangeResult<()> {
        let token = self.bearer().await?;
        let response = self
            .http
            .delete(format!("{}/orders/{}", self.base_url, id))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Err(ExchangeError::OrderNotFound(id.clone()));
        }
        Self::check_status(response).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn list_open_orders(&self) -> ExchangeResult<Vec<Order>> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/orders", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let envelope: ResultsEnvelope<ParadexOrder> = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        envelope
            .results
            .into_iter()
            .filter(|o| Self::parse_status(&o.status).is_open())
            .map(Self::to_canonical_order)
            .collect()
    }

    #[instrument(skip(self))]
    async fn get_position(&self) -> ExchangeResult<Position> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/positions", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let envelope: ResultsEnvelope<ParadexPosition> = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        let position = envelope
            .results
            .into_iter()
            .find(|p| p.market == self.market && p.status == "OPEN");

        Ok(match position {
            Some(p) => Position {
                venue: Venue::Paradex,
                size: p.size,
                entry_price: p.average_entry_price.unwrap_or(Decimal::ZERO),
                unrealized_pnl: p.unrealized_pnl.unwrap_or(Decimal::ZERO),
            },
            None => Position::flat(Venue::Paradex),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_calls_require_authentication() {
        let client = ParadexClient::with_base_url("k", "s", "http://localhost:1").unwrap();
        let result = client.place_market_order(Side::Buy, dec!(0.1)).await;
        assert!(matches!(result, Err(ExchangeError::Auth(_))));
    }

    #[tokio::test]
    async fn test_authenticate_stores_jwt_and_orders_flow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jwt_token": "header.payload.signature",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{
                    "id": "o-1",
                    "side": "SELL",
                    "type": "STOP_MARKET",
                    "status": "UNTRIGGERED",
                    "size": "0.1",
                    "trigger_price": "2900",
                    "created_at": 1700000000000i64,
                }],
            })))
            .mount(&server)
            .await;

        let client = ParadexClient::with_base_url("k", "s", &server.uri()).unwrap();
        client.authenticate().await.unwrap();

        let orders = client.list_open_orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].kind, OrderKind::Stop);
        assert_eq!(orders[0].trigger_price, Some(dec!(2900)));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let client = ParadexClient::with_base_url("k", "s", &server.uri()).unwrap();
        let result = client.authenticate().await;
        assert!(matches!(result, Err(ExchangeError::Auth(_))));
    }
}
