//! Position Supervisor (§4.G).
//!
//! One monitor task per open position, streaming quotes from the bridge
//! and evaluating the exit rules in priority order: time stop, stop
//! loss, take profit. On trigger the position moves to `Closing` and an
//! opposite-side market order is resubmitted through the execution
//! stage's gate and serialization. A close that keeps failing after
//! three retries, one second apart, is marked `StuckClosing` and leaves
//! no further automated action.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bridge::order::OrderState;
use crate::bridge::Bridge;
use crate::model::{Direction, ExitReason, Position, PositionStatus};
use crate::shutdown::Shutdown;
use crate::stages::execution::ExecutionStage;
use crate::store::TradeStore;
use crate::TimeStamp;

const CLOSE_RETRY_ATTEMPTS: u32 = 3;
const CLOSE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pure evaluation of the ordered exit rule against a live price.
/// Exposed standalone so the priority ordering is testable without a
/// bridge or execution stage.
#[must_use]
pub fn evaluate_exit(position: &Position, price: Decimal, now: TimeStamp) -> Option<ExitReason> {
    if now >= position.max_hold_until {
        return Some(ExitReason::TimeStop);
    }
    match position.direction {
        Direction::Long => {
            if price <= position.stop_price {
                Some(ExitReason::StopLoss)
            } else if price >= position.take_profit_price {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
        Direction::Short => {
            if price >= position.stop_price {
                Some(ExitReason::StopLoss)
            } else if price <= position.take_profit_price {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
    }
}

fn hold_deadline(max_hold_until: TimeStamp) -> tokio::time::Instant {
    let remaining = (max_hold_until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::Instant::now() + remaining
}

pub struct PositionSupervisor {
    bridge: Bridge,
    execution: Arc<ExecutionStage>,
    store: Arc<dyn TradeStore>,
}

impl PositionSupervisor {
    #[must_use]
    pub fn new(bridge: Bridge, execution: Arc<ExecutionStage>, store: Arc<dyn TradeStore>) -> Self {
        Self {
            bridge,
            execution,
            store,
        }
    }

    /// Spawns one monitor task per position received from the execution
    /// stage and waits for all of them to wind down on shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut positions_in: mpsc::Receiver<Position>,
        mut shutdown: Shutdown,
    ) {
        let mut handles = Vec::new();
        loop {
            let position = tokio::select! {
                position = positions_in.recv() => position,
                () = shutdown.recv() => break,
            };
            let Some(position) = position else { break };
            let stage = self.clone();
            let child_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                stage.monitor(position, child_shutdown).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn monitor(&self, mut position: Position, mut shutdown: Shutdown) {
        let mut quotes = match self.bridge.stream_quotes(&position.symbol) {
            Ok(stream) => stream,
            Err(err) => {
                error!(%err, symbol = %position.symbol, "failed to subscribe to quotes for open position");
                return;
            }
        };

        loop {
            let deadline = hold_deadline(position.max_hold_until);
            tokio::select! {
                tick = quotes.rx.recv() => {
                    let Some(tick) = tick else { return };
                    if let Some(reason) = evaluate_exit(&position, tick.price, Utc::now()) {
                        self.close(&mut position, reason).await;
                        return;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    self.close(&mut position, ExitReason::TimeStop).await;
                    return;
                }
                () = shutdown.recv() => return,
            }
        }
    }

    async fn close(&self, position: &mut Position, reason: ExitReason) {
        position.status = PositionStatus::Closing;
        info!(position_id = position.id, symbol = %position.symbol, ?reason, "position exit triggered");

        for attempt in 1..=CLOSE_RETRY_ATTEMPTS {
            match self.execution.submit_exit(position).await {
                Ok(status) if status.state == OrderState::Filled => {
                    let exit_price = status.avg_fill_price.unwrap_or(position.entry_price);
                    let exit_at = Utc::now();
                    let pnl = position.realize(exit_price, exit_at);
                    if let Err(err) = self.store.close_position(position.id, exit_price, exit_at, pnl) {
                        error!(%err, position_id = position.id, "failed to persist closed position");
                    }
                    return;
                }
                Ok(status) => {
                    warn!(
                        position_id = position.id,
                        attempt,
                        state = ?status.state,
                        "exit order not filled, retrying"
                    );
                }
                Err(err) => {
                    warn!(%err, position_id = position.id, attempt, "exit order submission failed, retrying");
                }
            }
            if attempt < CLOSE_RETRY_ATTEMPTS {
                tokio::time::sleep(CLOSE_RETRY_DELAY).await;
            }
        }

        position.status = PositionStatus::StuckClosing;
        error!(
            position_id = position.id,
            symbol = %position.symbol,
            "position stuck closing after repeated order failures, operator intervention required"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Symbol;
    use rust_decimal_macros::dec;

    fn sample_position(direction: Direction) -> Position {
        Position {
            id: 1,
            symbol: Symbol::parse("KITT").unwrap(),
            direction,
            qty: 100,
            entry_price: dec!(10.00),
            entry_at: Utc::now(),
            stop_price: if direction == Direction::Long { dec!(9.50) } else { dec!(10.50) },
            take_profit_price: if direction == Direction::Long { dec!(10.50) } else { dec!(9.50) },
            max_hold_until: Utc::now() + chrono::Duration::seconds(600),
            status: PositionStatus::Open,
            origin_article_id: "a1".into(),
            exit_price: None,
            exit_at: None,
            pnl: None,
        }
    }

    #[test]
    fn long_stop_loss_triggers_below_stop() {
        let position = sample_position(Direction::Long);
        let reason = evaluate_exit(&position, dec!(9.40), Utc::now());
        assert_eq!(reason, Some(ExitReason::StopLoss));
    }

    #[test]
    fn long_take_profit_triggers_above_target() {
        let position = sample_position(Direction::Long);
        let reason = evaluate_exit(&position, dec!(10.60), Utc::now());
        assert_eq!(reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn short_stop_loss_triggers_above_stop() {
        let position = sample_position(Direction::Short);
        let reason = evaluate_exit(&position, dec!(10.60), Utc::now());
        assert_eq!(reason, Some(ExitReason::StopLoss));
    }

    #[test]
    fn no_trigger_inside_band() {
        let position = sample_position(Direction::Long);
        let reason = evaluate_exit(&position, dec!(10.10), Utc::now());
        assert_eq!(reason, None);
    }

    #[test]
    fn time_stop_overrides_price_inside_band() {
        let mut position = sample_position(Direction::Long);
        position.max_hold_until = Utc::now() - chrono::Duration::seconds(1);
        let reason = evaluate_exit(&position, dec!(10.10), Utc::now());
        assert_eq!(reason, Some(ExitReason::TimeStop));
    }
}
