//! Detection Stage (§4.E).
//!
//! A fixed-size worker pool. Each worker fetches closed candles and a
//! current snapshot for a `TickerEvent`'s symbol, computes ATR(10) and
//! SMA-Volume(20) (degrading gracefully when fewer than 20 bars are on
//! hand — the 11-bar fetch below never actually supplies 20, so this
//! path is the steady state, not an edge case), and evaluates the price
//! and volume shock rules. A firing symbol is suppressed for
//! `cooldown` afterward.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::model::{Bar, Direction, TickerEvent, TradeSignal};
use crate::shutdown::Shutdown;
use crate::Result;

/// Bars fetched per symbol: one more than the 10 closed bars actually
/// used, giving the fetch a one-bar margin against off-by-one vendor
/// responses without changing the arithmetic below.
const BARS_REQUESTED: usize = 11;
const CLOSED_BARS_USED: usize = 10;
const COMBINED_DEADLINE: Duration = Duration::from_secs(2);
const BAR_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct DetectionParams {
    pub price_mult: f64,
    pub vol_mult: f64,
    pub cooldown: Duration,
}

/// Pure evaluation of the shock rule against already-fetched bars and a
/// snapshot. Exposed standalone so the numerical kernel is testable
/// without a bridge.
#[must_use]
pub fn evaluate(closed: &[Bar], snapshot_price: rust_decimal::Decimal, snapshot_cum_volume: rust_decimal::Decimal, params: &DetectionParams) -> Option<(Direction, f64, rust_decimal::Decimal)> {
    if closed.len() < CLOSED_BARS_USED {
        return None;
    }
    let atr10 = average_true_range(closed);
    let sma_vol20 = sma_volume(closed);

    let last = closed.last().copied()?;
    let b_cur_open = last.close;
    let b_cur_close = snapshot_price;
    let b_cur_volume = (snapshot_cum_volume - last.volume).max(rust_decimal::Decimal::ZERO);

    let open_f = b_cur_open.to_f64().unwrap_or(0.0);
    let close_f = b_cur_close.to_f64().unwrap_or(0.0);
    let volume_f = b_cur_volume.to_f64().unwrap_or(0.0);
    if open_f == 0.0 {
        return None;
    }

    let delta = close_f - open_f;
    let price_shock = delta.abs() > atr10 * params.price_mult;
    let volume_shock = volume_f > sma_vol20 * params.vol_mult;

    if !(price_shock && volume_shock) {
        return None;
    }

    let direction = if close_f > open_f {
        Direction::Long
    } else {
        Direction::Short
    };
    let atr_decimal = rust_decimal::Decimal::try_from(atr10).unwrap_or_default();
    let stop = match direction {
        Direction::Long => b_cur_open - atr_decimal,
        Direction::Short => b_cur_open + atr_decimal,
    };
    Some((direction, atr10, stop))
}

fn average_true_range(closed: &[Bar]) -> f64 {
    if closed.len() < 2 {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut count = 0u32;
    for window in closed.windows(2) {
        let prev_close = window[0].close.to_f64().unwrap_or(0.0);
        let high = window[1].high.to_f64().unwrap_or(0.0);
        let low = window[1].low.to_f64().unwrap_or(0.0);
        let tr = (high - low)
            .abs()
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        sum += tr;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / f64::from(count)
    }
}

fn sma_volume(closed: &[Bar]) -> f64 {
    if closed.is_empty() {
        return 0.0;
    }
    let sum: f64 = closed.iter().map(|b| b.volume.to_f64().unwrap_or(0.0)).sum();
    sum / closed.len() as f64
}

struct Cooldowns {
    fired_at: HashMap<crate::model::Symbol, Instant>,
}

impl Cooldowns {
    fn new() -> Self {
        Self {
            fired_at: HashMap::new(),
        }
    }

    fn is_suppressed(&self, symbol: &crate::model::Symbol, cooldown: Duration) -> bool {
        self.fired_at
            .get(symbol)
            .is_some_and(|at| at.elapsed() < cooldown)
    }

    fn mark(&mut self, symbol: crate::model::Symbol) {
        self.fired_at.insert(symbol, Instant::now());
    }
}

pub struct DetectionStage {
    bridge: Bridge,
    params: DetectionParams,
}

impl DetectionStage {
    #[must_use]
    pub fn new(bridge: Bridge, params: DetectionParams) -> Self {
        Self { bridge, params }
    }

    /// Spawns `worker_count` tasks pulling from a shared input queue.
    pub fn spawn_workers(
        self: Arc<Self>,
        worker_count: usize,
        input: mpsc::Receiver<TickerEvent>,
        out: mpsc::Sender<TradeSignal>,
        shutdown: Shutdown,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let input = Arc::new(Mutex::new(input));
        let cooldowns = Arc::new(Mutex::new(Cooldowns::new()));
        (0..worker_count.max(1))
            .map(|_| {
                let stage = self.clone();
                let input = input.clone();
                let out = out.clone();
                let cooldowns = cooldowns.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let event = tokio::select! {
                            event = async { input.lock().await.recv().await } => event,
                            () = shutdown.recv() => return,
                        };
                        let Some(event) = event else { return };
                        stage.process(event, &cooldowns, &out).await;
                    }
                })
            })
            .collect()
    }

    async fn process(
        &self,
        event: TickerEvent,
        cooldowns: &Arc<Mutex<Cooldowns>>,
        out: &mpsc::Sender<TradeSignal>,
    ) {
        if cooldowns.lock().await.is_suppressed(&event.symbol, self.params.cooldown) {
            debug!(symbol = %event.symbol, "symbol in cooldown, skipping");
            return;
        }

        let fetch_result = tokio::time::timeout(COMBINED_DEADLINE, async {
            let bars = self.fetch_bars_with_retry(&event.symbol).await?;
            let snapshot = self
                .bridge
                .snapshot_quote(&event.symbol, COMBINED_DEADLINE)
                .await?;
            Ok::<_, crate::Error>((bars, snapshot))
        })
        .await;

        let (bars, snapshot) = match fetch_result {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                warn!(symbol = %event.symbol, %err, "detection fetch failed");
                return;
            }
            Err(_) => {
                warn!(symbol = %event.symbol, "detection fetch timed out");
                return;
            }
        };

        let closed: Vec<Bar> = bars.into_iter().take(CLOSED_BARS_USED).collect();
        if closed.len() < CLOSED_BARS_USED {
            debug!(symbol = %event.symbol, got = closed.len(), "fewer than 10 closed bars, no signal");
            return;
        }

        let Some((direction, _atr, stop)) =
            evaluate(&closed, snapshot.price, snapshot.cum_volume, &self.params)
        else {
            return;
        };

        cooldowns.lock().await.mark(event.symbol.clone());

        let signal = TradeSignal {
            symbol: event.symbol,
            direction,
            signal_price: snapshot.price,
            stop_price: stop,
            created_at: chrono::Utc::now(),
            origin_article_id: event.article_id,
        };
        if out.send(signal).await.is_err() {
            warn!("execution stage queue closed");
        }
    }

    async fn fetch_bars_with_retry(&self, symbol: &crate::model::Symbol) -> Result<Vec<Bar>> {
        match self
            .bridge
            .fetch_historical_bars(symbol, BARS_REQUESTED, COMBINED_DEADLINE)
            .await
        {
            Ok(bars) => Ok(bars),
            Err(err) => {
                warn!(symbol = %symbol, %err, "historical bar fetch failed, retrying once");
                tokio::time::sleep(BAR_RETRY_DELAY).await;
                self.bridge
                    .fetch_historical_bars(symbol, BARS_REQUESTED, COMBINED_DEADLINE)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn bar(open: rust_decimal::Decimal, high: rust_decimal::Decimal, low: rust_decimal::Decimal, close: rust_decimal::Decimal, volume: rust_decimal::Decimal) -> Bar {
        Bar {
            ts: Utc::now(),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn flat_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|_| bar(dec!(10.00), dec!(10.05), dec!(9.95), dec!(10.00), dec!(1000)))
            .collect()
    }

    #[test]
    fn happy_path_long_signal_fires() {
        let closed = flat_bars(10);
        let params = DetectionParams {
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown: Duration::from_secs(300),
        };
        let result = evaluate(&closed, dec!(10.40), dec!(7000), &params);
        let (direction, _atr, stop) = result.expect("expected shock signal");
        assert_eq!(direction, Direction::Long);
        assert_eq!(stop, dec!(9.90));
    }

    #[test]
    fn volume_only_shock_does_not_fire() {
        let closed = flat_bars(10);
        let params = DetectionParams {
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown: Duration::from_secs(300),
        };
        // price delta too small to trip the price-shock leg.
        let result = evaluate(&closed, dec!(10.01), dec!(7000), &params);
        assert!(result.is_none());
    }

    #[test]
    fn price_only_shock_does_not_fire() {
        let closed = flat_bars(10);
        let params = DetectionParams {
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown: Duration::from_secs(300),
        };
        let result = evaluate(&closed, dec!(10.40), dec!(1500), &params);
        assert!(result.is_none());
    }

    #[test]
    fn short_direction_places_stop_above_open() {
        let closed = flat_bars(10);
        let params = DetectionParams {
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown: Duration::from_secs(300),
        };
        let (direction, _atr, stop) = evaluate(&closed, dec!(9.60), dec!(7000), &params).unwrap();
        assert_eq!(direction, Direction::Short);
        assert_eq!(stop, dec!(10.10));
    }

    #[test]
    fn fewer_than_ten_closed_bars_never_fires() {
        let closed = flat_bars(9);
        let params = DetectionParams {
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown: Duration::from_secs(300),
        };
        // Price and volume deltas large enough to fire if the bar-count
        // floor weren't enforced.
        let result = evaluate(&closed, dec!(10.40), dec!(7000), &params);
        assert!(result.is_none());
    }
}
