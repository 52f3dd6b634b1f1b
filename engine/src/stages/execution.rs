//! Execution Stage (§4.F).
//!
//! A single serial worker so order submissions stay strictly ordered.
//! Reads the connection supervisor's gate immediately before every
//! submission, sizes the order off the last account summary (refreshed
//! when stale), and hands the resulting `Position` to the position
//! supervisor on fill.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bridge::contract::Contract;
use crate::bridge::order::{Action, OrderRequest, OrderState, OrderStatus};
use crate::bridge::Bridge;
use crate::model::{ArticleId, Direction, Position, PositionStatus, TradeSignal};
use crate::shutdown::Shutdown;
use crate::store::TradeStore;
use crate::supervisor::Gate;

const ACCOUNT_STALE_TOLERANCE: Duration = Duration::from_secs(30);
const ORDER_DEADLINE: Duration = Duration::from_secs(5);
const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct RiskParams {
    pub per_trade_fraction: f64,
    pub take_profit_pct: f64,
    pub max_hold: Duration,
    pub primary_exchange: String,
}

struct AccountCache {
    value: Decimal,
    as_of: Instant,
}

pub struct ExecutionStage {
    bridge: Bridge,
    gate: Gate,
    store: Arc<dyn TradeStore>,
    params: RiskParams,
    next_position_id: AtomicU64,
    account_cache: tokio::sync::Mutex<Option<AccountCache>>,
    seen_articles: tokio::sync::Mutex<HashMap<ArticleId, Instant>>,
    /// Serializes every broker order submission — entries from `handle`
    /// and exits submitted on the position supervisor's behalf via
    /// [`Self::submit_exit`] — so ordering stays single-file per §4.F.
    submission_lock: tokio::sync::Mutex<()>,
}

impl ExecutionStage {
    #[must_use]
    pub fn new(bridge: Bridge, gate: Gate, store: Arc<dyn TradeStore>, params: RiskParams) -> Self {
        Self {
            bridge,
            gate,
            store,
            params,
            next_position_id: AtomicU64::new(1),
            account_cache: tokio::sync::Mutex::new(None),
            seen_articles: tokio::sync::Mutex::new(HashMap::new()),
            submission_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Submits an opposite-side market order closing `position`, on
    /// behalf of the position supervisor, through the same gate check
    /// and serialization every entry order goes through.
    pub async fn submit_exit(&self, position: &Position) -> crate::Result<OrderStatus> {
        if !self.gate.is_open() {
            return Err(crate::Error::DataQuality(format!(
                "gate closed, cannot submit exit for position {}",
                position.id
            )));
        }
        let action = match position.direction {
            Direction::Long => Action::Sell,
            Direction::Short => Action::Buy,
        };
        let contract = Contract::equity(&position.symbol, &self.params.primary_exchange);
        let order = OrderRequest {
            contract,
            action,
            total_qty: position.qty,
        };
        let (status, progress) = {
            let _permit = self.submission_lock.lock().await;
            self.bridge.place_order_watched(order, ORDER_DEADLINE).await?
        };
        drain_progress(progress, &format!("exit:{}", position.id));
        Ok(status)
    }

    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<TradeSignal>,
        positions_out: mpsc::Sender<Position>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let signal = tokio::select! {
                signal = signals.recv() => signal,
                () = shutdown.recv() => return,
            };
            let Some(signal) = signal else { return };
            if let Some(position) = self.handle(signal).await {
                if positions_out.send(position).await.is_err() {
                    warn!("position supervisor queue closed");
                }
            }
        }
    }

    async fn handle(&self, signal: TradeSignal) -> Option<Position> {
        if !self.gate.is_open() {
            warn!(symbol = %signal.symbol, "gate closed, dropping signal");
            return None;
        }

        let open_positions = match self.store.list_open() {
            Ok(open) => open,
            Err(err) => {
                warn!(%err, symbol = %signal.symbol, "unable to check open positions, dropping signal");
                return None;
            }
        };
        if open_positions.iter().any(|p| p.symbol == signal.symbol) {
            let err = crate::Error::Invariant(format!(
                "duplicate position rejected: {} already has an open position",
                signal.symbol
            ));
            warn!(%err, symbol = %signal.symbol, origin_article_id = %signal.origin_article_id, "rejecting signal, position already open");
            return None;
        }

        if signal.direction == Direction::Short {
            warn!(
                symbol = %signal.symbol,
                origin_article_id = %signal.origin_article_id,
                "DataQuality: short signal rejected at execution, no locate collaborator"
            );
            return None;
        }

        if self.is_duplicate(&signal.origin_article_id).await {
            warn!(origin_article_id = %signal.origin_article_id, "duplicate signal within idempotency window, dropping");
            return None;
        }

        let account_value = match self.account_value().await {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "unable to refresh account value, dropping signal");
                return None;
            }
        };

        let risk_amount = account_value * Decimal::try_from(self.params.per_trade_fraction).unwrap_or_default();
        let denom = (signal.signal_price - signal.stop_price).abs();
        if denom.is_zero() {
            warn!(symbol = %signal.symbol, "zero stop distance, dropping signal");
            return None;
        }
        let qty = (risk_amount / denom).trunc();
        let qty: i64 = qty.to_i64().unwrap_or(0);
        if qty < 1 {
            warn!(symbol = %signal.symbol, "sized quantity below 1 share, dropping");
            return None;
        }

        let contract = Contract::equity(&signal.symbol, &self.params.primary_exchange);
        let order = OrderRequest {
            contract,
            action: Action::Buy,
            total_qty: qty,
        };

        let result = {
            let _permit = self.submission_lock.lock().await;
            self.bridge.place_order_watched(order, ORDER_DEADLINE).await
        };
        let (status, progress) = match result {
            Ok(pair) => pair,
            Err(err) => {
                warn!(symbol = %signal.symbol, %err, "order submission failed");
                return None;
            }
        };
        drain_progress(progress, &format!("entry:{}", signal.symbol));

        if status.filled_qty == 0 || status.state == OrderState::Cancelled {
            info!(symbol = %signal.symbol, state = ?status.state, "order not filled");
            return None;
        }

        let fill_price = status.avg_fill_price.unwrap_or(signal.signal_price);
        let entry_at = chrono::Utc::now();
        let take_profit_price = fill_price
            * (Decimal::ONE + Decimal::try_from(self.params.take_profit_pct).unwrap_or_default());
        let max_hold_until = entry_at + chrono::Duration::from_std(self.params.max_hold).unwrap_or_default();

        let position = Position {
            id: self.next_position_id.fetch_add(1, Ordering::Relaxed),
            symbol: signal.symbol,
            direction: Direction::Long,
            qty: status.filled_qty,
            entry_price: fill_price,
            entry_at,
            stop_price: signal.stop_price,
            take_profit_price,
            max_hold_until,
            status: PositionStatus::Open,
            origin_article_id: signal.origin_article_id,
            exit_price: None,
            exit_at: None,
            pnl: None,
        };

        if let Err(err) = self.store.open_position(&position) {
            error!(
                %err,
                position_id = position.id,
                symbol = %position.symbol,
                "STORE FAILURE: just-filled order has no durable record, degrading connection; operator intervention required"
            );
            self.bridge.report_store_failure();
        }

        Some(position)
    }

    async fn is_duplicate(&self, article_id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen_articles.lock().await;
        seen.retain(|_, at| now.duration_since(*at) < IDEMPOTENCY_WINDOW);
        if seen.contains_key(article_id) {
            true
        } else {
            seen.insert(article_id.to_string(), now);
            false
        }
    }

    async fn account_value(&self) -> crate::Result<Decimal> {
        let mut cache = self.account_cache.lock().await;
        let now = Instant::now();
        if let Some(cached) = cache.as_ref() {
            if now.duration_since(cached.as_of) < ACCOUNT_STALE_TOLERANCE {
                return Ok(cached.value);
            }
        }
        let value = self.bridge.account_summary(Duration::from_secs(2)).await?;
        *cache = Some(AccountCache { value, as_of: now });
        Ok(value)
    }
}

/// Logs every non-terminal order state buffered on the progress channel
/// by the time the terminal resolution arrived. Best-effort: a missed
/// intermediate update changes nothing about the outcome already known.
fn drain_progress(mut progress: mpsc::UnboundedReceiver<OrderState>, context: &str) {
    while let Ok(state) = progress.try_recv() {
        debug!(context, ?state, "order progress");
    }
}
