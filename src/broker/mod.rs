// =============================================================================
// BrokerPort — abstract broker I/O seam
// =============================================================================
//
// Everything the engine needs from a broker lives behind this trait: order
// placement/cancel/modify, an order event stream with a poll fallback, and
// quotes. Failures carry an error class, not a transport type — retry policy
// is decided on the class alone.
// =============================================================================

pub mod http;
pub mod paper;
pub mod rate_limit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{OrderSide, OrderStatus, OrderType, Quote};

/// Behaviour class of a broker failure, independent of transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Timeouts, 5xx, rate limits, stream drops. Retry with backoff.
    Transient,
    /// 401/403. One token refresh, then one retry.
    Auth,
    /// Price band / tick size / freeze qty violations. Never retry.
    Validation,
    /// Insufficient margin, symbol suspended. Never retry.
    Business,
    /// Duplicate client order id at the storage layer. Idempotent success.
    Integrity,
    /// Corrupt state or unrecoverable backend loss. Pause, flatten, exit.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::Business => "business",
            Self::Integrity => "integrity",
            Self::Fatal => "fatal",
        }
    }
}

/// A classified broker failure.
#[derive(Debug, Clone)]
pub struct BrokerError {
    pub class: ErrorClass,
    pub message: String,
}

impl BrokerError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Auth, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Business, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Fatal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class.as_str(), self.message)
    }
}

impl std::error::Error for BrokerError {}

/// A new-order request forwarded to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub order_type: OrderType,
    /// Limit price or SL trigger price; None for MARKET.
    pub price: Option<f64>,
}

/// Broker acknowledgement of a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAck {
    pub broker_id: String,
    /// Unix millis.
    pub ack_ts: i64,
}

/// An order state change observed at the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub avg_price: Option<f64>,
    /// Unix millis.
    pub ts: i64,
}

/// Abstract broker I/O. Implementations: [`http::HttpBroker`] for the live
/// gateway, [`paper::PaperBroker`] for PAPER mode and tests.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> Result<BrokerAck, BrokerError>;

    async fn cancel_order(&self, client_order_id: &str) -> Result<(), BrokerError>;

    async fn modify_order(
        &self,
        client_order_id: &str,
        new_price: f64,
        new_qty: i64,
    ) -> Result<(), BrokerError>;

    /// Live order event stream. The watcher also has a poll fallback; the
    /// stream heartbeat must tick even when idle.
    fn order_events(&self) -> broadcast::Receiver<OrderEvent>;

    /// Snapshot of current order states, mapped to the same event shape.
    async fn poll_orders(&self) -> Result<Vec<OrderEvent>, BrokerError>;

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError>;

    /// Re-authenticate after a 401/403. One attempt per failed call.
    async fn refresh_token(&self) -> Result<(), BrokerError>;
}

// =============================================================================
// ModalBroker — routes calls to the paper or live transport per trading mode
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Wraps the paper broker and an optional live gateway behind one port.
///
/// PAPER mode routes everything to the simulation; LIVE routes to the
/// gateway. Order events from both transports are merged into one channel so
/// the watcher never cares which side produced an event. Switching to LIVE
/// without a configured gateway is refused.
pub struct ModalBroker {
    paper: Arc<paper::PaperBroker>,
    live: Option<Arc<dyn BrokerPort>>,
    is_live: AtomicBool,
    events_tx: broadcast::Sender<OrderEvent>,
}

impl ModalBroker {
    pub fn new(paper: Arc<paper::PaperBroker>, live: Option<Arc<dyn BrokerPort>>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1024);
        let modal = Arc::new(Self {
            paper: paper.clone(),
            live: live.clone(),
            is_live: AtomicBool::new(false),
            events_tx,
        });

        // Merge both transports' event streams into one channel.
        Self::forward(paper.order_events(), modal.events_tx.clone());
        if let Some(live) = live {
            Self::forward(live.order_events(), modal.events_tx.clone());
        }
        modal
    }

    fn forward(mut rx: broadcast::Receiver<OrderEvent>, tx: broadcast::Sender<OrderEvent>) {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Flip routing. LIVE requires a configured gateway.
    pub fn set_live(&self, live: bool) -> Result<(), BrokerError> {
        if live && self.live.is_none() {
            return Err(BrokerError::validation("live broker gateway not configured"));
        }
        self.is_live.store(live, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.is_live.load(Ordering::SeqCst)
    }

    pub fn has_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn paper(&self) -> &Arc<paper::PaperBroker> {
        &self.paper
    }

    fn current(&self) -> Arc<dyn BrokerPort> {
        if self.is_live() {
            self.live.clone().expect("live routing without gateway")
        } else {
            self.paper.clone()
        }
    }
}

#[async_trait]
impl BrokerPort for ModalBroker {
    async fn place_order(&self, req: &OrderRequest) -> Result<BrokerAck, BrokerError> {
        self.current().place_order(req).await
    }

    async fn cancel_order(&self, client_order_id: &str) -> Result<(), BrokerError> {
        self.current().cancel_order(client_order_id).await
    }

    async fn modify_order(
        &self,
        client_order_id: &str,
        new_price: f64,
        new_qty: i64,
    ) -> Result<(), BrokerError> {
        self.current().modify_order(client_order_id, new_price, new_qty).await
    }

    fn order_events(&self) -> broadcast::Receiver<OrderEvent> {
        self.events_tx.subscribe()
    }

    async fn poll_orders(&self) -> Result<Vec<OrderEvent>, BrokerError> {
        self.current().poll_orders().await
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.current().quote(symbol).await
    }

    async fn refresh_token(&self) -> Result<(), BrokerError> {
        self.current().refresh_token().await
    }
}
