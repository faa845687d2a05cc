// =============================================================================
// HttpBroker — HMAC-SHA256 signed REST gateway client + order event stream
// =============================================================================
//
// SECURITY: the secret key is never logged or serialised. Signed requests
// carry the API key, a millisecond timestamp, and an HMAC-SHA256 signature
// over `{method}{path}{timestamp}{body}`.
//
// HTTP failures are classified by status code: 408/429/5xx are transient,
// 401/403 are auth, 400/422 are validation, 402/409 are business. The
// execution engine decides retry policy from the class alone.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::broker::{BrokerAck, BrokerError, BrokerPort, ErrorClass, OrderEvent, OrderRequest};
use crate::types::{OrderStatus, Quote};

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Live broker gateway client.
pub struct HttpBroker {
    api_key: String,
    secret: String,
    base_url: String,
    order_stream_url: String,
    client: reqwest::Client,
    events_tx: broadcast::Sender<OrderEvent>,
}

impl HttpBroker {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        order_stream_url: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.into(),
            order_stream_url: order_stream_url.into(),
            client,
            events_tx,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature over the canonical request string.
    fn sign(&self, method: &str, path: &str, timestamp: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(timestamp.to_string().as_bytes());
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Send a signed request and parse the JSON body, classifying failures.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let ts = Self::timestamp_ms();
        let signature = self.sign(method.as_str(), path, ts, &body_str);

        let mut req = self
            .client
            .request(method, &url)
            .header("X-API-KEY", &self.api_key)
            .header("X-TIMESTAMP", ts.to_string())
            .header("X-SIGNATURE", signature);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BrokerError::transient(format!("request to {path} timed out"))
                } else {
                    BrokerError::transient(format!("request to {path} failed: {e}"))
                }
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BrokerError::transient(format!("failed to read body from {path}: {e}")))?;

        if !status.is_success() {
            let class = classify_status(status.as_u16());
            return Err(BrokerError::new(
                class,
                format!("{path} returned {status}: {text}"),
            ));
        }

        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| BrokerError::transient(format!("malformed response from {path}: {e}")))
    }

    // -------------------------------------------------------------------------
    // Order event stream
    // -------------------------------------------------------------------------

    /// Connect to the gateway order WebSocket and forward events into the
    /// broadcast channel. Returns when the stream drops so the caller's
    /// reconnect loop can restart it.
    pub async fn run_order_stream(
        &self,
        heartbeat: impl Fn() + Send + Sync,
    ) -> anyhow::Result<()> {
        use anyhow::Context;

        info!(url = %self.order_stream_url, "connecting to order event stream");
        let (ws, _resp) = tokio_tungstenite::connect_async(&self.order_stream_url)
            .await
            .context("failed to connect to order event stream")?;
        info!("order event stream connected");

        let (_write, mut read) = ws.split();

        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    // Every frame counts as a heartbeat, ping/pong included.
                    heartbeat();
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_order_event(&text) {
                            Ok(Some(event)) => {
                                let _ = self.events_tx.send(event);
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "failed to parse order event"),
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "order event stream read error");
                    return Err(e.into());
                }
                None => {
                    warn!("order event stream ended");
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl BrokerPort for HttpBroker {
    #[instrument(skip(self, req), fields(client_order_id = %req.client_order_id), name = "broker::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> Result<BrokerAck, BrokerError> {
        let body = serde_json::json!({
            "client_order_id": req.client_order_id,
            "symbol": req.symbol,
            "side": req.side.as_str(),
            "qty": req.qty,
            "type": req.order_type.as_str(),
            "price": req.price,
        });

        let resp = self
            .signed_request(reqwest::Method::POST, "/orders", Some(body))
            .await?;

        let broker_id = resp["order_id"]
            .as_str()
            .map(|s| s.to_string())
            .or_else(|| resp["order_id"].as_u64().map(|n| n.to_string()))
            .ok_or_else(|| BrokerError::transient("order ack missing order_id"))?;
        let ack_ts = resp["ts"].as_i64().unwrap_or_else(Self::timestamp_ms);

        debug!(broker_id = %broker_id, "order placed");
        Ok(BrokerAck { broker_id, ack_ts })
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    async fn cancel_order(&self, client_order_id: &str) -> Result<(), BrokerError> {
        let path = format!("/orders/{client_order_id}");
        self.signed_request(reqwest::Method::DELETE, &path, None)
            .await?;
        debug!(client_order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "broker::modify_order")]
    async fn modify_order(
        &self,
        client_order_id: &str,
        new_price: f64,
        new_qty: i64,
    ) -> Result<(), BrokerError> {
        let path = format!("/orders/{client_order_id}");
        let body = serde_json::json!({ "price": new_price, "qty": new_qty });
        self.signed_request(reqwest::Method::PUT, &path, Some(body))
            .await?;
        Ok(())
    }

    fn order_events(&self) -> broadcast::Receiver<OrderEvent> {
        self.events_tx.subscribe()
    }

    async fn poll_orders(&self) -> Result<Vec<OrderEvent>, BrokerError> {
        let resp = self
            .signed_request(reqwest::Method::GET, "/orders", None)
            .await?;

        let rows = resp
            .as_array()
            .ok_or_else(|| BrokerError::transient("orders response is not an array"))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(event) = json_to_order_event(row) {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let path = format!("/quotes/{symbol}");
        let resp = self.signed_request(reqwest::Method::GET, &path, None).await?;

        Ok(Quote {
            last: resp["last"].as_f64().unwrap_or(0.0),
            bid: resp["bid"].as_f64().unwrap_or(0.0),
            ask: resp["ask"].as_f64().unwrap_or(0.0),
            ts: resp["ts"].as_i64().unwrap_or_else(Self::timestamp_ms),
        })
    }

    async fn refresh_token(&self) -> Result<(), BrokerError> {
        self.signed_request(reqwest::Method::POST, "/auth/refresh", None)
            .await?;
        info!("broker session token refreshed");
        Ok(())
    }
}

impl std::fmt::Debug for HttpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBroker")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Wire mapping
// =============================================================================

/// Map an HTTP status to a broker error class.
fn classify_status(status: u16) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Auth,
        408 | 429 => ErrorClass::Transient,
        400 | 422 => ErrorClass::Validation,
        402 | 409 => ErrorClass::Business,
        s if s >= 500 => ErrorClass::Transient,
        _ => ErrorClass::Business,
    }
}

/// Map a gateway order status string to the internal status.
fn map_wire_status(s: &str) -> Option<OrderStatus> {
    match s {
        "NEW" | "PENDING" => Some(OrderStatus::New),
        "OPEN" | "PLACED" | "ACKED" | "TRIGGER_PENDING" => Some(OrderStatus::Placed),
        "PARTIAL" | "PARTIALLY_FILLED" => Some(OrderStatus::Partial),
        "FILLED" | "COMPLETE" | "TRADED" => Some(OrderStatus::Filled),
        "CANCELED" | "CANCELLED" => Some(OrderStatus::Canceled),
        "REJECTED" => Some(OrderStatus::Rejected),
        _ => None,
    }
}

fn json_to_order_event(v: &serde_json::Value) -> Option<OrderEvent> {
    let client_order_id = v["client_order_id"].as_str()?.to_string();
    let status = map_wire_status(v["status"].as_str()?)?;
    Some(OrderEvent {
        client_order_id,
        status,
        filled_qty: v["filled_qty"].as_i64().unwrap_or(0),
        avg_price: v["avg_price"].as_f64(),
        ts: v["ts"].as_i64().unwrap_or(0),
    })
}

/// Parse one order stream frame. Non-order frames (heartbeats) yield None.
fn parse_order_event(text: &str) -> anyhow::Result<Option<OrderEvent>> {
    let root: serde_json::Value = serde_json::from_str(text)?;
    if root["type"].as_str() == Some("heartbeat") {
        return Ok(None);
    }
    Ok(json_to_order_event(&root))
}
