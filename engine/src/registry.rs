//! Request Registry (§4.A/§5).
//!
//! Every outbound bridge request gets a monotonic `RequestId` and a slot
//! in this table. Completions arrive asynchronously off the dispatch
//! loop and resolve the slot's `Awaiter` exactly once — by payload, by
//! vendor error, by the reaper's timeout, or by cancellation on
//! disconnect. A caller `await`s a [`Completion`], never the raw
//! channel, so the three outcomes all funnel through the same
//! `Result<AwaiterPayload>`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bridge::errors::ErrorClass;
use crate::bridge::order::{OrderState, OrderStatus};
use crate::bridge::Tick;
use crate::model::{Bar, QuoteSnapshot, Symbol};
use crate::{EngineError, RequestId, Result};

/// The resolved value of a completed request. One variant per
/// `BrokerEventKind` that can terminate an awaited request.
#[derive(Debug)]
pub enum AwaiterPayload {
    ConnectionAck,
    Bars(Vec<Bar>),
    Snapshot(QuoteSnapshot),
    Order(OrderStatus),
    Account(rust_decimal::Decimal),
    Positions(Vec<(Symbol, i64)>),
}

struct PendingBars {
    collected: Vec<Bar>,
}

struct PendingPositions {
    collected: Vec<(Symbol, i64)>,
}

enum Slot {
    /// Waiting for a single terminal event.
    Single(oneshot::Sender<Result<AwaiterPayload>>),
    /// Waiting for a `HistoricalBar*` then `HistoricalBarsEnd` sequence.
    Bars(oneshot::Sender<Result<AwaiterPayload>>, PendingBars),
    /// Waiting for a `PositionReport*` then `PositionsEnd` sequence.
    Positions(oneshot::Sender<Result<AwaiterPayload>>, PendingPositions),
    /// Waiting for a terminal `OrderStatus`, forwarding every non-terminal
    /// one it sees along the way to the progress channel.
    Order(oneshot::Sender<Result<AwaiterPayload>>, mpsc::UnboundedSender<OrderState>),
}

struct Entry {
    slot: Slot,
    expires_at: Instant,
    /// Transient requests (those outstanding during a disconnect) get
    /// cancelled rather than timed out so the caller sees a distinct
    /// error.
    transient: bool,
}

/// Tracks every in-flight bridge request and resolves them as events
/// arrive off the dispatch loop.
#[derive(Debug)]
pub struct RequestRegistry {
    next_id: AtomicU64,
    entries: std::sync::Mutex<HashMap<RequestId, Entry>>,
}

trait LockExt<T> {
    fn lock_ignore_poison(&self) -> std::sync::MutexGuard<'_, T>;
}

impl<T> LockExt<T> for std::sync::Mutex<T> {
    fn lock_ignore_poison(&self) -> std::sync::MutexGuard<'_, T> {
        self.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry").finish_non_exhaustive()
    }
}

impl RequestRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Allocate a fresh request id and a waiter slot with the given
    /// timeout. The caller must `await` the returned [`Completion`]
    /// exactly once.
    pub fn register(self: &Arc<Self>, timeout: Duration) -> (RequestId, Completion) {
        let req_id = self.next_fixed_id();
        let (tx, rx) = oneshot::channel();
        self.entries.lock_ignore_poison().insert(
            req_id,
            Entry {
                slot: Slot::Single(tx),
                expires_at: Instant::now() + timeout,
                transient: true,
            },
        );
        (
            req_id,
            Completion {
                req_id,
                rx,
                registry: self.clone(),
            },
        )
    }

    /// Allocate a request id for historical bars, which stream as a
    /// sequence of partial events terminated by `HistoricalBarsEnd`.
    pub fn register_bars(self: &Arc<Self>, timeout: Duration) -> (RequestId, Completion) {
        let req_id = self.next_fixed_id();
        let (tx, rx) = oneshot::channel();
        self.entries.lock_ignore_poison().insert(
            req_id,
            Entry {
                slot: Slot::Bars(tx, PendingBars { collected: Vec::new() }),
                expires_at: Instant::now() + timeout,
                transient: true,
            },
        );
        (
            req_id,
            Completion {
                req_id,
                rx,
                registry: self.clone(),
            },
        )
    }

    /// Allocate a request id for a broker position listing, which
    /// streams as a sequence of `PositionReport` events terminated by
    /// `PositionsEnd`.
    pub fn register_positions(self: &Arc<Self>, timeout: Duration) -> (RequestId, Completion) {
        let req_id = self.next_fixed_id();
        let (tx, rx) = oneshot::channel();
        self.entries.lock_ignore_poison().insert(
            req_id,
            Entry {
                slot: Slot::Positions(
                    tx,
                    PendingPositions {
                        collected: Vec::new(),
                    },
                ),
                expires_at: Instant::now() + timeout,
                transient: true,
            },
        );
        (
            req_id,
            Completion {
                req_id,
                rx,
                registry: self.clone(),
            },
        )
    }

    /// Allocate a request id for an order submission. Every non-terminal
    /// `OrderStatus` delivered before the terminal one is forwarded on
    /// the returned progress channel instead of being dropped.
    pub fn register_order(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> (RequestId, Completion, mpsc::UnboundedReceiver<OrderState>) {
        let req_id = self.next_fixed_id();
        let (tx, rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        self.entries.lock_ignore_poison().insert(
            req_id,
            Entry {
                slot: Slot::Order(tx, progress_tx),
                expires_at: Instant::now() + timeout,
                transient: true,
            },
        );
        (
            req_id,
            Completion {
                req_id,
                rx,
                registry: self.clone(),
            },
            progress_rx,
        )
    }

    /// Allocate a request id with no waiter — fire-and-forget requests
    /// such as `StreamQuote` or `SubscribeNews`, which have no single
    /// terminal response.
    #[must_use]
    pub fn next_fixed_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn resolve(&self, req_id: RequestId, payload: Result<AwaiterPayload>) {
        if let Some(entry) = self.entries.lock_ignore_poison().remove(&req_id) {
            let tx = match entry.slot {
                Slot::Single(tx) | Slot::Bars(tx, _) | Slot::Positions(tx, _) | Slot::Order(tx, _) => tx,
            };
            let _ = tx.send(payload);
        } else {
            trace!(req_id, "no awaiter for resolved request");
        }
    }

    pub fn deliver_connection_ack(&self, req_id: RequestId) {
        self.resolve(req_id, Ok(AwaiterPayload::ConnectionAck));
    }

    pub fn deliver_account(&self, req_id: RequestId, value: rust_decimal::Decimal) {
        self.resolve(req_id, Ok(AwaiterPayload::Account(value)));
    }

    pub fn deliver_order_status(&self, req_id: RequestId, status: OrderStatus) {
        if status.is_terminal() {
            self.resolve(req_id, Ok(AwaiterPayload::Order(status)));
            return;
        }
        let entries = self.entries.lock_ignore_poison();
        if let Some(Entry {
            slot: Slot::Order(_, progress_tx),
            ..
        }) = entries.get(&req_id)
        {
            let _ = progress_tx.send(status.state);
        }
    }

    /// Delivers a streamed quote tick. Returns `true` if an awaiter
    /// (a `MktSnapshot` request) claimed it; `false` means the tick is
    /// unsolicited and must be routed by symbol instead.
    pub fn deliver_tick(&self, req_id: RequestId, tick: Tick) -> bool {
        if req_id == 0 {
            return false;
        }
        let entries = self.entries.lock_ignore_poison();
        let claimed = entries.contains_key(&req_id);
        drop(entries);
        if claimed {
            self.resolve(
                req_id,
                Ok(AwaiterPayload::Snapshot(QuoteSnapshot {
                    price: tick.price,
                    cum_volume: tick.cum_volume,
                    as_of: tick.ts,
                })),
            );
        }
        claimed
    }

    pub fn deliver_partial_bar(&self, req_id: RequestId, bar: Bar) {
        let mut entries = self.entries.lock_ignore_poison();
        if let Some(Entry {
            slot: Slot::Bars(_, pending),
            ..
        }) = entries.get_mut(&req_id)
        {
            pending.collected.push(bar);
        }
    }

    pub fn deliver_bars_end(&self, req_id: RequestId) {
        self.resolve_bars(req_id);
    }

    fn resolve_bars(&self, req_id: RequestId) {
        let entry = self.entries.lock_ignore_poison().remove(&req_id);
        if let Some(Entry {
            slot: Slot::Bars(tx, pending),
            ..
        }) = entry
        {
            let _ = tx.send(Ok(AwaiterPayload::Bars(pending.collected)));
        }
    }

    pub fn deliver_position_report(&self, req_id: RequestId, symbol: Symbol, qty: i64) {
        let mut entries = self.entries.lock_ignore_poison();
        if let Some(Entry {
            slot: Slot::Positions(_, pending),
            ..
        }) = entries.get_mut(&req_id)
        {
            pending.collected.push((symbol, qty));
        }
    }

    pub fn deliver_positions_end(&self, req_id: RequestId) {
        let entry = self.entries.lock_ignore_poison().remove(&req_id);
        if let Some(Entry {
            slot: Slot::Positions(tx, pending),
            ..
        }) = entry
        {
            let _ = tx.send(Ok(AwaiterPayload::Positions(pending.collected)));
        }
    }

    pub fn deliver_error(&self, req_id: RequestId, code: i32, msg: String, class: ErrorClass) {
        if req_id == 0 {
            debug!(code, %msg, ?class, "unsolicited vendor error");
            return;
        }
        let err = match class {
            ErrorClass::Fatal | ErrorClass::Transient => EngineError::BrokerRejected {
                req_id,
                code,
                msg,
            },
            ErrorClass::Informational | ErrorClass::Warning => return,
        };
        self.resolve(req_id, Err(err));
    }

    /// Fails every outstanding transient request on disconnect, so
    /// callers see [`EngineError::Cancelled`] instead of waiting out
    /// their own timeout.
    pub fn cancel_all_transient(&self) {
        let stale: Vec<RequestId> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.transient)
            .map(|(id, _)| *id)
            .collect();
        for req_id in stale {
            self.resolve(req_id, Err(EngineError::Cancelled { req_id: Some(req_id) }));
        }
    }

    /// Fails every awaiter whose deadline has passed. Intended to be
    /// driven by a periodic reaper task spawned alongside the bridge.
    pub fn reap_expired(&self) {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for req_id in expired {
            self.resolve(req_id, Err(EngineError::Timeout { req_id: Some(req_id) }));
        }
    }

    /// Spawns the periodic reaper task; returns its `JoinHandle` so the
    /// caller can abort it on shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.reap_expired();
            }
        })
    }
}

/// A future resolving to the outcome of a single bridge request:
/// the vendor's payload, a broker rejection, a timeout, or cancellation
/// on disconnect.
pub struct Completion {
    req_id: RequestId,
    rx: oneshot::Receiver<Result<AwaiterPayload>>,
    registry: Arc<RequestRegistry>,
}

impl Future for Completion {
    type Output = Result<AwaiterPayload>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EngineError::Cancelled {
                req_id: Some(this.req_id),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // If the caller drops the future without awaiting it (e.g. a
        // `select!` loses the race), stop tracking the request so it
        // doesn't leak until the reaper eventually times it out.
        self.registry.entries.lock_ignore_poison().remove(&self.req_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_single_awaiter() {
        let registry = RequestRegistry::new();
        let (req_id, completion) = registry.register(Duration::from_secs(5));
        registry.deliver_account(req_id, rust_decimal::Decimal::new(1000, 0));
        match completion.await.unwrap() {
            AwaiterPayload::Account(v) => assert_eq!(v, rust_decimal::Decimal::new(1000, 0)),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn collects_bars_until_end_marker() {
        let registry = RequestRegistry::new();
        let (req_id, completion) = registry.register_bars(Duration::from_secs(5));
        let now = chrono::Utc::now();
        for _ in 0..3 {
            registry.deliver_partial_bar(
                req_id,
                Bar {
                    ts: now,
                    open: Default::default(),
                    high: Default::default(),
                    low: Default::default(),
                    close: Default::default(),
                    volume: Default::default(),
                },
            );
        }
        registry.deliver_bars_end(req_id);
        match completion.await.unwrap() {
            AwaiterPayload::Bars(bars) => assert_eq!(bars.len(), 3),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_all_transient_fails_outstanding() {
        let registry = RequestRegistry::new();
        let (_req_id, completion) = registry.register(Duration::from_secs(5));
        registry.cancel_all_transient();
        assert!(matches!(
            completion.await,
            Err(EngineError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn order_progress_surfaces_non_terminal_states_before_resolution() {
        let registry = RequestRegistry::new();
        let (req_id, completion, mut progress) = registry.register_order(Duration::from_secs(5));
        registry.deliver_order_status(
            req_id,
            OrderStatus {
                order_id: req_id,
                state: OrderState::Submitted,
                filled_qty: 0,
                avg_fill_price: None,
            },
        );
        registry.deliver_order_status(
            req_id,
            OrderStatus {
                order_id: req_id,
                state: OrderState::Filled,
                filled_qty: 10,
                avg_fill_price: Some(rust_decimal::Decimal::new(1000, 2)),
            },
        );
        assert_eq!(progress.recv().await.unwrap(), OrderState::Submitted);
        match completion.await.unwrap() {
            AwaiterPayload::Order(status) => assert_eq!(status.state, OrderState::Filled),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reap_expired_times_out() {
        let registry = RequestRegistry::new();
        let (_req_id, completion) = registry.register(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.reap_expired();
        assert!(matches!(completion.await, Err(EngineError::Timeout { .. })));
    }
}
