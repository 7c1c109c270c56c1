//! Backpack REST API adapter.
//!
//! Signs each request with HMAC-SHA256 over the instruction name and the
//! alphabetically-sorted request parameters, the scheme Backpack verifies
//! server-side. All payload parsing happens here; callers only ever see
//! the canonical types.

use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::traits::{ExchangeAdapter, Venue};
use crate::exchange::types::{Order, OrderHandle, OrderId, OrderKind, OrderStatus, Position, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

const API_URL: &str = "https://api.backpack.exchange/api/v1";
const MARKET: &str = "ETH_USDC_PERP";
const SIGNING_WINDOW_MS: u64 = 5000;

/// Backpack exchange client.
pub struct BackpackClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    market: String,
}

// ==================== Venue payload shapes ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackpackOrder {
    id: String,
    side: String,
    order_type: String,
    status: String,
    #[serde(with = "rust_decimal::serde::str")]
    quantity: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    trigger_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    executed_quantity: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    avg_fill_price: Option<Decimal>,
    created_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackpackPosition {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    net_quantity: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    entry_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    unrealized_pnl: Option<Decimal>,
}

impl BackpackClient {
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
        })
    }

    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    /// HMAC-SHA256 signature over instruction + sorted params + timestamp.
    fn sign(&self, instruction: &str, params: &[(&str, String)], timestamp: u64) -> String {
        let mut sorted: Vec<(&str, String)> = params.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let mut payload = format!("instruction={}", instruction);
        for (key, value) in &sorted {
            payload.push_str(&format!("&{}={}", key, urlencoding::encode(value)));
        }
        payload.push_str(&format!(
            "&timestamp={}&window={}",
            timestamp, SIGNING_WINDOW_MS
        ));

        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn auth_headers(&self, instruction: &str, params: &[(&str, String)]) -> [(String, String); 4] {
        let timestamp = Self::timestamp();
        let signature = self.sign(instruction, params, timestamp);
        [
            ("X-API-KEY".to_string(), self.api_key.clone()),
            ("X-SIGNATURE".to_string(), signature),
            ("X-TIMESTAMP".to_string(), timestamp.to_string()),
            ("X-WINDOW".to_string(), SIGNING_WINDOW_MS.to_string()),
        ]
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
            Side::Buy => "Bid",
            Side::Sell => "Ask",
        }
    }

    fn parse_side(raw: &str) -> ExchangeResult<Side> {
        match raw {
            "Bid" => Ok(Side::Buy),
            "Ask" => Ok(Side::Sell),
            other => Err(ExchangeError::InvalidResponse(format!(
                "unknown side {other:?}"
            ))),
        }
    }

    fn parse_status(raw: &str) -> OrderStatus {
        match raw {
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "Canceled" => OrderStatus::Canceled,
            "Rejected" | "Expired" => OrderStatus::Rejected,
            _ => OrderStatus::Open,
        }
    }

    fn parse_kind(raw: &str) -> OrderKind {
        match raw {
            "Limit" => OrderKind::Limit,
            "StopMarket" | "Stop" => OrderKind::Stop,
            _ => OrderKind::Market,
        }
    }

    fn parse_timestamp(millis: i64) -> ExchangeResult<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            ExchangeError::InvalidResponse(format!("timestamp {millis} out of range"))
        })
    }

    fn to_canonical_order(&self, raw: BackpackOrder) -> ExchangeResult<Order> {
        let created_at = Self::parse_timestamp(raw.created_at)?;
        Ok(Order {
            id: OrderId::new(raw.id),
            venue: Venue::Backpack,
            side: Self::parse_side(&raw.side)?,
            kind: Self::parse_kind(&raw.order_type),
            size: raw.quantity,
            price: raw.price,
            trigger_price: raw.trigger_price,
            status: Self::parse_status(&raw.status),
            executed_size: raw.executed_quantity.unwrap_or(Decimal::ZERO),
            created_at,
            last_seen_at: Utc::now(),
        })
    }

    async fn submit_order(&self, body: serde_json::Value) -> ExchangeResult<OrderHandle> {
        let params: Vec<(&str, String)> = body
            .as_object()
            .expect("order body is an object")
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.as_str(), value)
            })
            .collect();
        let headers = self.auth_headers("orderExecute", &params);

        let mut request = self.http.post(format!("{}/order", self.base_url));
        for (name, value) in headers {
            request = request.header(name, value);
        }

        debug!(market = %self.market, "submitting Backpack order");
        let response = request.json(&body).send().await?;
        let response = Self::check_status(response).await?;
        let raw: BackpackOrder = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        Ok(OrderHandle {
            id: OrderId::new(raw.id),
            status: Self::parse_status(&raw.status),
            executed_size: raw.executed_quantity.unwrap_or(Decimal::ZERO),
            avg_fill_price: raw.avg_fill_price.unwrap_or(Decimal::ZERO),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BackpackClient {
    fn venue(&self) -> Venue {
        Venue::Backpack
    }

    #[instrument(skip(self))]
    async fn authenticate(&self) -> ExchangeResult<()> {
        let params: Vec<(&str, String)> = Vec::new();
        let headers = self.auth_headers("accountQuery", &params);

        let mut request = self.http.get(format!("{}/account", self.base_url));
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        Self::check_status(response)
            .await
            .map_err(|e| match e {
                ExchangeError::Auth(msg) => ExchangeError::Auth(msg),
                other => ExchangeError::Auth(other.to_string()),
            })
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn place_market_order(&self, side: Side, size: Decimal) -> ExchangeResult<OrderHandle> {
        self.submit_order(serde_json::json!({
            "orderType": "Market",
            "side": Self::side_param(side),
            "symbol": self.market,
            "quantity": size.to_string(),
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
            "orderType": "Limit",
            "side": Self::side_param(side),
            "symbol": self.market,
            "quantity": size.to_string(),
            "price": price.to_string(),
            "reduceOnly": true,
            "timeInForce": "GTC",
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
            "orderType": "StopMarket",
            "side": Self::side_param(side),
            "symbol": self.market,
            "quantity": size.to_string(),
            "triggerPrice": trigger_price.to_string(),
            "reduceOnly": true,
        }))
        .await
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, id: &OrderId) -> ExchangeResult<()> {
        let params = [
            ("orderId", id.as_str().to_string()),
            ("symbol", self.market.clone()),
        ];
        let headers = self.auth_headers("orderCancel", &params);

        let mut request = self
            .http
            .delete(format!("{}/order", self.base_url))
            .query(&[("symbol", self.market.as_str()), ("orderId", id.as_str())]);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if response.status().as_u16() == 404 {
            return Err(ExchangeError::OrderNotFound(id.clone()));
        }
        Self::check_status(response).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn list_open_orders(&self) -> ExchangeResult<Vec<Order>> {
        let params = [
            ("marketType", "PERP".to_string()),
            ("symbol", self.market.clone()),
        ];
        let headers = self.auth_headers("orderQueryAll", &params);

        let mut request = self
            .http
            .get(format!("{}/orders", self.base_url))
            .query(&[("symbol", self.market.as_str()), ("marketType", "PERP")]);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let response = Self::check_status(response).await?;
        let raw: Vec<BackpackOrder> = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        raw.into_iter()
            .map(|o| self.to_canonical_order(o))
            .collect()
    }

    #[instrument(skip(self))]
    async fn get_position(&self) -> ExchangeResult<Position> {
        let params: Vec<(&str, String)> = Vec::new();
        let headers = self.auth_headers("positionQuery", &params);

        let mut request = self.http.get(format!("{}/position", self.base_url));
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let response = Self::check_status(response).await?;
        let raw: Vec<BackpackPosition> = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        let position = raw
            .into_iter()
            .find(|p| p.symbol == self.market && p.net_quantity != Decimal::ZERO);

        Ok(match position {
            Some(p) => Position {
                venue: Venue::Backpack,
                size: p.net_quantity,
                entry_price: p.entry_price.unwrap_or(Decimal::ZERO),
                unrealized_pnl: p.unrealized_pnl.unwrap_or(Decimal::ZERO),
            },
            None => Position::flat(Venue::Backpack),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str) -> BackpackClient {
        BackpackClient::with_base_url("test-key", "test-secret", base_url).unwrap()
    }

    #[test]
    fn test_signature_is_deterministic() {
        let client = client("http://localhost");
        let params = [("symbol", MARKET.to_string()), ("orderId", "42".to_string())];
        let a = client.sign("orderCancel", &params, 1700000000000);
        let b = client.sign("orderCancel", &params, 1700000000000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA256
    }

    #[test]
    fn test_signature_sorts_params() {
        let client = client("http://localhost");
        let forward = [("a", "1".to_string()), ("b", "2".to_string())];
        let reverse = [("b", "2".to_string()), ("a", "1".to_string())];
        assert_eq!(
            client.sign("orderExecute", &forward, 1700000000000),
            client.sign("orderExecute", &reverse, 1700000000000)
        );
    }

    #[tokio::test]
    async fn test_place_market_order_parses_fill() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "112233",
                "side": "Bid",
                "orderType": "Market",
                "status": "Filled",
                "quantity": "0.1",
                "executedQuantity": "0.1",
                "avgFillPrice": "3000.50",
                "createdAt": 1700000000000i64,
            })))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let handle = client
            .place_market_order(Side::Buy, dec!(0.1))
            .await
            .unwrap();

        assert_eq!(handle.id, OrderId::new("112233"));
        assert!(handle.is_filled());
        assert_eq!(handle.executed_size, dec!(0.1));
        assert_eq!(handle.avg_fill_price, dec!(3000.50));
    }

    #[tokio::test]
    async fn test_rejected_order_maps_to_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order"))
            .respond_with(ResponseTemplate::new(400).set_body_string("INSUFFICIENT_MARGIN"))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let result = client.place_market_order(Side::Sell, dec!(0.1)).await;
        assert!(matches!(result, Err(ExchangeError::OrderRejected(_))));
    }

    #[tokio::test]
    async fn test_list_open_orders_maps_to_canonical() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": "9",
                "side": "Ask",
                "orderType": "Limit",
                "status": "New",
                "quantity": "0.2",
                "price": "3100",
                "createdAt": 1700000000000i64,
            }])))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let orders = client.list_open_orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Sell);
        assert_eq!(orders[0].kind, OrderKind::Limit);
        assert!(orders[0].status.is_open());
        assert_eq!(orders[0].price, Some(dec!(3100)));
    }

    #[tokio::test]
    async fn test_flat_position_when_no_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/position"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let position = client.get_position().await.unwrap();
        assert!(!position.is_open());
    }
}
