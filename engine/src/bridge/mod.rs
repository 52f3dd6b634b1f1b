//! Broker Bridge (§4.A).
//!
//! Wraps a [`VendorSession`] — a blocking, callback-driven vendor client —
//! on a dedicated OS thread, and exposes an async request/response façade
//! to the rest of the engine: an async façade over a blocking wrapper,
//! with the direction reversed from the usual split since the vendor
//! client itself is the blocking side.

pub mod contract;
pub mod errors;
pub mod order;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot_like::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::bridge::contract::{Contract, NEWS_GENERIC_TICK_LIST};
use crate::bridge::errors::{classify, ErrorClass};
use crate::bridge::order::{OrderRequest, OrderState, OrderStatus};
use crate::bridge::session::VendorSession;
use crate::model::{Bar, QuoteSnapshot, Symbol};
use crate::registry::{AwaiterPayload, RequestRegistry};
use crate::{ClientId, EngineError, RequestId, Result};

/// A minimal, dependency-free stand-in for a `parking_lot::Mutex` so the
/// bridge's lock discipline (no I/O while held) reads the same regardless
/// of which mutex crate backs it; aliases `std::sync::Mutex` under the
/// hood.
mod parking_lot_like {
    pub struct Mutex<T>(std::sync::Mutex<T>);
    impl<T> Mutex<T> {
        pub fn new(value: T) -> Self {
            Self(std::sync::Mutex::new(value))
        }
        pub fn lock(&self) -> std::sync::MutexGuard<'_, T> {
            self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }
}

/// News article as handed up from the vendor's broad-tape subscription.
#[derive(Debug, Clone)]
pub struct NewsArticle {
    pub article_id: String,
    pub published_at: crate::TimeStamp,
    pub headline: String,
    pub body: String,
    pub symbols_hint: Vec<String>,
}

/// A single price/size tick on a streamed or snapshot quote.
#[derive(Debug, Clone)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: rust_decimal::Decimal,
    pub cum_volume: rust_decimal::Decimal,
    pub ts: crate::TimeStamp,
}

#[derive(Debug, Clone, Copy)]
pub enum BarSize {
    OneMin,
}

#[derive(Debug, Clone)]
pub enum BrokerRequestKind {
    Connect {
        host: String,
        port: u16,
        client_id: ClientId,
    },
    HistBars {
        symbol: Symbol,
        bar_size: BarSize,
        count: usize,
    },
    MktSnapshot {
        symbol: Symbol,
    },
    StreamQuote {
        symbol: Symbol,
    },
    PlaceOrder {
        order: OrderRequest,
    },
    CancelOrder {
        target_req_id: RequestId,
    },
    SubscribeNews {
        contract: Contract,
        generic_tick_list: String,
    },
    AccountSummary,
    Positions,
}

#[derive(Debug, Clone)]
pub struct BrokerRequest {
    pub req_id: RequestId,
    pub kind: BrokerRequestKind,
    pub deadline: crate::TimeStamp,
}

#[derive(Debug, Clone)]
pub enum BrokerEventKind {
    NewsArticle(NewsArticle),
    Tick(Tick),
    HistoricalBar(Bar),
    HistoricalBarsEnd,
    OrderStatus(OrderStatus),
    AccountValue(rust_decimal::Decimal),
    PositionReport { symbol: Symbol, qty: i64 },
    PositionsEnd,
    Error { code: i32, msg: String },
    ConnectionAck,
    ConnectionClosed,
}

#[derive(Debug, Clone)]
pub struct BrokerEvent {
    /// `0` for unsolicited (news ticks, connection events).
    pub req_id: RequestId,
    pub kind: BrokerEventKind,
}

enum WorkerCommand {
    Submit(BrokerRequest),
    Cancel(RequestId),
    Shutdown,
}

/// Handle to a symbol's streamed quotes; dropping it (or calling
/// [`QuoteStream::cancel`]) unregisters the subscription.
pub struct QuoteStream {
    pub symbol: Symbol,
    pub rx: mpsc::UnboundedReceiver<Tick>,
}

struct Subscriptions {
    quotes: HashMap<Symbol, Vec<mpsc::UnboundedSender<Tick>>>,
}

/// Session-level lifecycle signal, observed by the connection supervisor
/// (§4.C) alongside the request/response traffic carried by
/// [`RequestRegistry`]. `StoreFault` is not a vendor event at all: the
/// execution stage raises it when a durable write fails for a
/// just-filled order, so the supervisor can demote the gate the same
/// way it would for a dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ack,
    Closed,
    StoreFault,
}

/// The Broker Bridge. Cheaply cloneable; every clone shares the same
/// worker thread and registry.
#[derive(Clone)]
pub struct Bridge {
    registry: Arc<RequestRegistry>,
    cmd_tx: Sender<WorkerCommand>,
    news_tx: broadcast::Sender<NewsArticle>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    subs: Arc<Mutex<Subscriptions>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").finish_non_exhaustive()
    }
}

impl Bridge {
    /// Spawn the dedicated worker thread and the dispatcher task. Returns
    /// the bridge façade; the caller owns the worker `JoinHandle` for
    /// final shutdown.
    pub fn spawn(
        mut session: Box<dyn VendorSession>,
        registry: Arc<RequestRegistry>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = unbounded::<WorkerCommand>();
        let (event_tx, event_rx) = bounded::<BrokerEvent>(4096);

        let worker_event_rx = event_rx.clone();
        let worker = std::thread::spawn(move || {
            worker_loop(session.as_mut(), &cmd_rx, &event_tx, &worker_event_rx);
        });

        let (news_tx, _) = broadcast::channel(1024);
        let (status_tx, _) = broadcast::channel(16);
        let subs = Arc::new(Mutex::new(Subscriptions {
            quotes: HashMap::new(),
        }));

        let bridge = Self {
            registry,
            cmd_tx,
            news_tx,
            status_tx,
            subs,
        };

        tokio::spawn(dispatch_loop(
            event_rx,
            bridge.registry.clone(),
            bridge.news_tx.clone(),
            bridge.status_tx.clone(),
            bridge.subs.clone(),
        ));

        (bridge, worker)
    }

    /// Subscribe to connection lifecycle events (ack, closed). Used by the
    /// connection supervisor to drive its state machine; the
    /// request/response traffic itself still flows through the registry.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<()> {
        let (req_id, completion) = self.registry.register(timeout);
        self.submit(BrokerRequest {
            req_id,
            kind: BrokerRequestKind::Connect {
                host: host.to_string(),
                port,
                client_id,
            },
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
        })?;
        match completion.await? {
            AwaiterPayload::ConnectionAck => Ok(()),
            other => Err(EngineError::Transport(format!(
                "unexpected response to connect: {other:?}"
            ))),
        }
    }

    pub fn subscribe_news(&self, provider_code: &str) -> Result<broadcast::Receiver<NewsArticle>> {
        let req_id = self.registry.next_fixed_id();
        self.submit(BrokerRequest {
            req_id,
            kind: BrokerRequestKind::SubscribeNews {
                contract: Contract::news_provider(provider_code),
                generic_tick_list: NEWS_GENERIC_TICK_LIST.to_string(),
            },
            deadline: Utc::now() + chrono::Duration::seconds(10),
        })?;
        Ok(self.news_tx.subscribe())
    }

    /// Signals the connection supervisor that a durable trade-store write
    /// failed for a just-filled order. Treated the same as a dropped
    /// connection: the gate closes and the state machine moves to
    /// `Degraded` until an operator intervenes (§4.F).
    pub fn report_store_failure(&self) {
        let _ = self.status_tx.send(ConnectionStatus::StoreFault);
    }

    pub async fn fetch_historical_bars(
        &self,
        symbol: &Symbol,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Bar>> {
        let (req_id, completion) = self.registry.register_bars(timeout);
        self.submit(BrokerRequest {
            req_id,
            kind: BrokerRequestKind::HistBars {
                symbol: symbol.clone(),
                bar_size: BarSize::OneMin,
                count,
            },
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
        })?;
        match completion.await? {
            AwaiterPayload::Bars(bars) => Ok(bars),
            other => Err(EngineError::DataQuality(format!(
                "unexpected response to historical bars: {other:?}"
            ))),
        }
    }

    pub async fn snapshot_quote(&self, symbol: &Symbol, timeout: Duration) -> Result<QuoteSnapshot> {
        let (req_id, completion) = self.registry.register(timeout);
        self.submit(BrokerRequest {
            req_id,
            kind: BrokerRequestKind::MktSnapshot {
                symbol: symbol.clone(),
            },
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
        })?;
        match completion.await? {
            AwaiterPayload::Snapshot(snap) => Ok(snap),
            other => Err(EngineError::DataQuality(format!(
                "unexpected response to snapshot: {other:?}"
            ))),
        }
    }

    /// Returns a cancellable stream of price ticks for `symbol`.
    pub fn stream_quotes(&self, symbol: &Symbol) -> Result<QuoteStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs
            .lock()
            .quotes
            .entry(symbol.clone())
            .or_default()
            .push(tx);
        let req_id = self.registry.next_fixed_id();
        self.submit(BrokerRequest {
            req_id,
            kind: BrokerRequestKind::StreamQuote {
                symbol: symbol.clone(),
            },
            deadline: Utc::now() + chrono::Duration::seconds(86_400),
        })?;
        Ok(QuoteStream {
            symbol: symbol.clone(),
            rx,
        })
    }

    pub async fn place_order(&self, order: OrderRequest, timeout: Duration) -> Result<OrderStatus> {
        let (status, _progress) = self.place_order_watched(order, timeout).await?;
        Ok(status)
    }

    /// Same as [`Self::place_order`], but also returns a channel of every
    /// non-terminal `OrderState` (`Submitted`, `PreSubmitted`) observed
    /// before the terminal resolution, so a caller can report order
    /// progress instead of only learning the final outcome.
    pub async fn place_order_watched(
        &self,
        order: OrderRequest,
        timeout: Duration,
    ) -> Result<(OrderStatus, mpsc::UnboundedReceiver<OrderState>)> {
        let (req_id, completion, progress) = self.registry.register_order(timeout);
        self.submit(BrokerRequest {
            req_id,
            kind: BrokerRequestKind::PlaceOrder { order },
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
        })?;
        match completion.await? {
            AwaiterPayload::Order(status) => Ok((status, progress)),
            other => Err(EngineError::BrokerRejected {
                req_id,
                code: 0,
                msg: format!("unexpected response to order: {other:?}"),
            }),
        }
    }

    pub async fn account_summary(&self, timeout: Duration) -> Result<rust_decimal::Decimal> {
        let (req_id, completion) = self.registry.register(timeout);
        self.submit(BrokerRequest {
            req_id,
            kind: BrokerRequestKind::AccountSummary,
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
        })?;
        match completion.await? {
            AwaiterPayload::Account(value) => Ok(value),
            other => Err(EngineError::DataQuality(format!(
                "unexpected response to account summary: {other:?}"
            ))),
        }
    }

    /// Requests the broker's reported open positions, used by the
    /// connection supervisor's sync checklist to reconcile against the
    /// durable trade store (§4.C).
    pub async fn fetch_positions(&self, timeout: Duration) -> Result<Vec<(Symbol, i64)>> {
        let (req_id, completion) = self.registry.register_positions(timeout);
        self.submit(BrokerRequest {
            req_id,
            kind: BrokerRequestKind::Positions,
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default(),
        })?;
        match completion.await? {
            AwaiterPayload::Positions(positions) => Ok(positions),
            other => Err(EngineError::DataQuality(format!(
                "unexpected response to positions: {other:?}"
            ))),
        }
    }

    /// Re-issues a `StreamQuote` request for every symbol with a live
    /// subscription. Called by the connection supervisor's sync
    /// checklist after reconnect, since the vendor forgets every
    /// subscription across a dropped session (§4.C step 4).
    pub fn resubscribe_quotes(&self) -> Result<()> {
        let symbols: Vec<Symbol> = self.subs.lock().quotes.keys().cloned().collect();
        for symbol in symbols {
            let req_id = self.registry.next_fixed_id();
            self.submit(BrokerRequest {
                req_id,
                kind: BrokerRequestKind::StreamQuote { symbol },
                deadline: Utc::now() + chrono::Duration::seconds(86_400),
            })?;
        }
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.cmd_tx
            .send(WorkerCommand::Shutdown)
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    fn submit(&self, request: BrokerRequest) -> Result<()> {
        self.cmd_tx
            .send(WorkerCommand::Submit(request))
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}

/// Build the equity contract for a symbol given the configured primary
/// exchange.
#[must_use]
pub fn equity_contract(symbol: &Symbol, primary_exchange: &str) -> Contract {
    Contract::equity(symbol, primary_exchange)
}

fn worker_loop(
    session: &mut dyn VendorSession,
    cmd_rx: &Receiver<WorkerCommand>,
    event_tx: &Sender<BrokerEvent>,
    event_rx: &Receiver<BrokerEvent>,
) {
    loop {
        match cmd_rx.try_recv() {
            Ok(WorkerCommand::Submit(request)) => {
                if let BrokerRequestKind::Connect {
                    ref host,
                    port,
                    client_id,
                } = request.kind
                {
                    match session.connect(host, port, client_id) {
                        Ok(()) => {
                            if event_tx
                                .send(BrokerEvent {
                                    req_id: request.req_id,
                                    kind: BrokerEventKind::ConnectionAck,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(err) => error!(req_id = request.req_id, %err, "vendor connect failed"),
                    }
                } else if let Err(err) = session.submit(&request) {
                    error!(req_id = request.req_id, %err, "vendor submit failed");
                }
            }
            Ok(WorkerCommand::Cancel(req_id)) => {
                if let Err(err) = session.cancel(req_id) {
                    warn!(req_id, %err, "vendor cancel failed");
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                let _ = session.disconnect();
                break;
            }
            Err(crossbeam_channel::TryRecvError::Empty) => {}
            Err(crossbeam_channel::TryRecvError::Disconnected) => break,
        }

        match session.poll_event(Duration::from_millis(50)) {
            Ok(Some(event)) => {
                // Tick events drop-oldest on overflow; everything else
                // blocks the producer (§5).
                let is_tick = matches!(event.kind, BrokerEventKind::Tick(_));
                if is_tick && event_tx.is_full() {
                    debug!("tick queue full, dropping oldest");
                    let _ = event_rx.try_recv();
                }
                if event_tx.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!(%err, "vendor poll failed");
            }
        }
    }
}

async fn dispatch_loop(
    event_rx: Receiver<BrokerEvent>,
    registry: Arc<RequestRegistry>,
    news_tx: broadcast::Sender<NewsArticle>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    subs: Arc<Mutex<Subscriptions>>,
) {
    loop {
        let event = match tokio::task::spawn_blocking({
            let event_rx = event_rx.clone();
            move || event_rx.recv()
        })
        .await
        {
            Ok(Ok(event)) => event,
            _ => break,
        };

        match event.kind {
            BrokerEventKind::NewsArticle(article) => {
                let _ = news_tx.send(article);
            }
            BrokerEventKind::Tick(tick) => {
                if !registry.deliver_tick(event.req_id, tick.clone()) {
                    let mut subs = subs.lock();
                    if let Some(senders) = subs.quotes.get_mut(&tick.symbol) {
                        senders.retain(|tx| tx.send(tick.clone()).is_ok());
                        if senders.is_empty() {
                            subs.quotes.remove(&tick.symbol);
                        }
                    }
                }
            }
            BrokerEventKind::HistoricalBar(bar) => {
                registry.deliver_partial_bar(event.req_id, bar);
            }
            BrokerEventKind::HistoricalBarsEnd => {
                registry.deliver_bars_end(event.req_id);
            }
            BrokerEventKind::OrderStatus(status) => {
                registry.deliver_order_status(event.req_id, status);
            }
            BrokerEventKind::AccountValue(value) => {
                registry.deliver_account(event.req_id, value);
            }
            BrokerEventKind::PositionReport { symbol, qty } => {
                registry.deliver_position_report(event.req_id, symbol, qty);
            }
            BrokerEventKind::PositionsEnd => {
                registry.deliver_positions_end(event.req_id);
            }
            BrokerEventKind::Error { code, msg } => {
                let class = classify(code);
                match class {
                    ErrorClass::Informational | ErrorClass::Warning => {
                        info!(code, %msg, "vendor notice");
                    }
                    ErrorClass::Transient | ErrorClass::Fatal => {
                        registry.deliver_error(event.req_id, code, msg, class);
                    }
                }
            }
            BrokerEventKind::ConnectionAck => {
                registry.deliver_connection_ack(event.req_id);
                let _ = status_tx.send(ConnectionStatus::Ack);
            }
            BrokerEventKind::ConnectionClosed => {
                registry.cancel_all_transient();
                let _ = status_tx.send(ConnectionStatus::Closed);
            }
        }
    }
}
