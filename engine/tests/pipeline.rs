//! End-to-end scenarios wired against `SimulatedSession`, one per
//! canonical case: happy-path long, volume-only rejection, cooldown
//! suppression, closed gate, reconnect reconciliation, time stop,
//! insufficient bar history, and duplicate-position rejection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use tapeshock::bridge::session::simulated::SimulatedSession;
use tapeshock::bridge::session::VendorSession;
use tapeshock::bridge::Bridge;
use tapeshock::model::{Bar, Direction, Position, PositionStatus, Symbol, TickerEvent, TradeSignal};
use tapeshock::queue;
use tapeshock::registry::RequestRegistry;
use tapeshock::shutdown::{Notifier, Shutdown};
use tapeshock::stages::detection::{DetectionParams, DetectionStage};
use tapeshock::stages::execution::{ExecutionStage, RiskParams};
use tapeshock::stages::position_supervisor::PositionSupervisor;
use tapeshock::store::{InMemoryTradeStore, TradeStore};
use tapeshock::supervisor::{ConnectionSupervisor, Gate};

fn flat_bars(n: usize) -> Vec<Bar> {
    (0..n)
        .map(|_| Bar {
            ts: Utc::now(),
            open: dec!(10.00),
            high: dec!(10.05),
            low: dec!(9.95),
            close: dec!(10.00),
            volume: dec!(1000),
        })
        .collect()
}

fn spawn_bridge(session: SimulatedSession) -> (Bridge, std::thread::JoinHandle<()>) {
    let registry = RequestRegistry::new();
    Bridge::spawn(Box::new(session) as Box<dyn VendorSession>, registry)
}

/// A `Shutdown` listener whose signalling half is leaked so it never
/// resolves during a test — tests that don't exercise graceful shutdown
/// directly just need a listener their stage's `select!` can hold.
fn lone_shutdown() -> Shutdown {
    let (notifier, _complete_rx) = Notifier::new();
    let notifier: &'static Notifier = Box::leak(Box::new(notifier));
    let (shutdown, complete_tx) = notifier.subscribe();
    std::mem::forget(complete_tx);
    shutdown
}

fn risk_params() -> RiskParams {
    RiskParams {
        per_trade_fraction: 0.01,
        take_profit_pct: 0.02,
        max_hold: Duration::from_secs(600),
        primary_exchange: "ISLAND".to_string(),
    }
}

/// Brings up a `ConnectionSupervisor` against `bridge` and waits for its
/// gate to open, so tests that exercise the execution/position stages
/// don't need to duplicate the sync-checklist handshake.
async fn opened_gate(bridge: Bridge, store: Arc<dyn TradeStore>) -> Gate {
    let on_sync: tapeshock::supervisor::ResumeHook = Arc::new(|| Ok(()));
    let supervisor = ConnectionSupervisor::new(bridge, store, "127.0.0.1", 7497, 7, on_sync);
    let gate = supervisor.gate();
    tokio::spawn(supervisor.run(lone_shutdown()));
    for _ in 0..200 {
        if gate.is_open() {
            return gate;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gate never opened");
}

#[tokio::test]
async fn happy_path_long_signal_produces_open_position() {
    let mut session = SimulatedSession::new();
    let symbol = Symbol::parse("TSLA").unwrap();
    session.bars_by_symbol.insert(symbol.clone(), flat_bars(10));
    session.snapshot_by_symbol.insert(
        symbol.clone(),
        tapeshock::model::QuoteSnapshot {
            price: dec!(10.40),
            cum_volume: dec!(7000),
            as_of: Utc::now(),
        },
    );
    session.fill_price_by_symbol.insert(symbol.clone(), dec!(10.42));
    session.account_value = dec!(100_000);
    let (bridge, _worker) = spawn_bridge(session);

    let store: Arc<dyn TradeStore> = Arc::new(InMemoryTradeStore::new());
    let gate = opened_gate(bridge.clone(), store.clone()).await;

    let detection = Arc::new(DetectionStage::new(
        bridge.clone(),
        DetectionParams {
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown: Duration::from_secs(300),
        },
    ));
    let (ticker_tx, ticker_rx) = queue::stage_channel();
    let (signal_tx, signal_rx) = queue::stage_channel();
    detection.spawn_workers(1, ticker_rx, signal_tx, lone_shutdown());

    let execution = Arc::new(ExecutionStage::new(bridge.clone(), gate, store.clone(), risk_params()));
    let (position_tx, mut position_rx) = queue::stage_channel();
    tokio::spawn(execution.run(signal_rx, position_tx, lone_shutdown()));

    ticker_tx
        .send(TickerEvent {
            symbol: symbol.clone(),
            article_id: "article-1".to_string(),
            published_at: Utc::now(),
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let position = tokio::time::timeout(Duration::from_secs(2), position_rx.recv())
        .await
        .expect("position stage timed out")
        .expect("expected an opened position");

    assert_eq!(position.symbol, symbol);
    assert_eq!(position.direction, Direction::Long);
    assert!(position.qty > 0);
    assert_eq!(position.entry_price, dec!(10.42));
    assert_eq!(store.list_open().unwrap().len(), 1);
}

#[tokio::test]
async fn volume_only_shock_is_rejected_before_execution() {
    let mut session = SimulatedSession::new();
    let symbol = Symbol::parse("KITT").unwrap();
    session.bars_by_symbol.insert(symbol.clone(), flat_bars(10));
    session.snapshot_by_symbol.insert(
        symbol.clone(),
        tapeshock::model::QuoteSnapshot {
            price: dec!(10.01),
            cum_volume: dec!(7000),
            as_of: Utc::now(),
        },
    );
    let (bridge, _worker) = spawn_bridge(session);

    let detection = Arc::new(DetectionStage::new(
        bridge,
        DetectionParams {
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown: Duration::from_secs(300),
        },
    ));
    let (ticker_tx, ticker_rx) = queue::stage_channel();
    let (signal_tx, mut signal_rx) = queue::stage_channel::<TradeSignal>();
    detection.spawn_workers(1, ticker_rx, signal_tx, lone_shutdown());

    ticker_tx
        .send(TickerEvent {
            symbol,
            article_id: "article-2".to_string(),
            published_at: Utc::now(),
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(500), signal_rx.recv()).await;
    assert!(result.is_err(), "no signal should have fired on a volume-only shock");
}

#[tokio::test]
async fn second_event_within_cooldown_is_suppressed() {
    let mut session = SimulatedSession::new();
    let symbol = Symbol::parse("NVDA").unwrap();
    session.bars_by_symbol.insert(symbol.clone(), flat_bars(10));
    session.snapshot_by_symbol.insert(
        symbol.clone(),
        tapeshock::model::QuoteSnapshot {
            price: dec!(10.40),
            cum_volume: dec!(7000),
            as_of: Utc::now(),
        },
    );
    let (bridge, _worker) = spawn_bridge(session);

    let detection = Arc::new(DetectionStage::new(
        bridge,
        DetectionParams {
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown: Duration::from_secs(300),
        },
    ));
    let (ticker_tx, ticker_rx) = queue::stage_channel();
    let (signal_tx, mut signal_rx) = queue::stage_channel::<TradeSignal>();
    detection.spawn_workers(1, ticker_rx, signal_tx, lone_shutdown());

    for article_id in ["article-3", "article-4"] {
        ticker_tx
            .send(TickerEvent {
                symbol: symbol.clone(),
                article_id: article_id.to_string(),
                published_at: Utc::now(),
                received_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let first = tokio::time::timeout(Duration::from_secs(2), signal_rx.recv())
        .await
        .expect("expected the first event to fire")
        .expect("channel closed");
    assert_eq!(first.origin_article_id, "article-3");

    let second = tokio::time::timeout(Duration::from_millis(500), signal_rx.recv()).await;
    assert!(second.is_err(), "cooldown should have suppressed the second event");
}

#[tokio::test]
async fn closed_gate_drops_signal_without_submitting_an_order() {
    let session = SimulatedSession::new();
    let (bridge, _worker) = spawn_bridge(session);
    let store: Arc<dyn TradeStore> = Arc::new(InMemoryTradeStore::new());

    // Gate is never opened by a connection supervisor here.
    let gate = Gate::new();
    let execution = Arc::new(ExecutionStage::new(bridge, gate, store.clone(), risk_params()));
    let (signal_tx, signal_rx) = queue::stage_channel();
    let (position_tx, mut position_rx) = queue::stage_channel();
    tokio::spawn(execution.run(signal_rx, position_tx, lone_shutdown()));

    signal_tx
        .send(TradeSignal {
            symbol: Symbol::parse("AMD").unwrap(),
            direction: Direction::Long,
            signal_price: dec!(10.40),
            stop_price: dec!(9.90),
            created_at: Utc::now(),
            origin_article_id: "article-5".to_string(),
        })
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(500), position_rx.recv()).await;
    assert!(result.is_err(), "no position should open while the gate is closed");
    assert!(store.list_open().unwrap().is_empty());
}

#[tokio::test]
async fn reconnect_sync_reconciles_positions_and_reopens_gate() {
    let mut session = SimulatedSession::new();
    session.broker_positions = vec![(Symbol::parse("QQQ").unwrap(), 50)];
    let (bridge, _worker) = spawn_bridge(session);

    let store: Arc<dyn TradeStore> = Arc::new(InMemoryTradeStore::new());
    let stored_position = Position {
        id: 1,
        symbol: Symbol::parse("QQQ").unwrap(),
        direction: Direction::Long,
        qty: 100,
        entry_price: dec!(300.00),
        entry_at: Utc::now(),
        stop_price: dec!(290.00),
        take_profit_price: dec!(310.00),
        max_hold_until: Utc::now() + chrono::Duration::seconds(600),
        status: PositionStatus::Open,
        origin_article_id: "article-6".to_string(),
        exit_price: None,
        exit_at: None,
        pnl: None,
    };
    store.open_position(&stored_position).unwrap();

    // The broker reports a different quantity than the store (50 vs
    // 100); the sync checklist still completes and opens the gate — the
    // mismatch is surfaced as a warning, not a hard failure (§4.C).
    let gate = opened_gate(bridge, store.clone()).await;
    assert!(gate.is_open());
    assert_eq!(store.list_open().unwrap().len(), 1);
}

#[tokio::test]
async fn max_hold_elapsed_triggers_time_stop_and_closes_position() {
    let mut session = SimulatedSession::new();
    let symbol = Symbol::parse("MSFT").unwrap();
    session.fill_price_by_symbol.insert(symbol.clone(), dec!(10.00));
    let (bridge, _worker) = spawn_bridge(session);

    let store: Arc<dyn TradeStore> = Arc::new(InMemoryTradeStore::new());
    let gate = opened_gate(bridge.clone(), store.clone()).await;
    let execution = Arc::new(ExecutionStage::new(bridge.clone(), gate, store.clone(), risk_params()));
    let position_supervisor = Arc::new(PositionSupervisor::new(bridge, execution, store.clone()));

    let position = Position {
        id: 1,
        symbol,
        direction: Direction::Long,
        qty: 100,
        entry_price: dec!(10.00),
        entry_at: Utc::now(),
        stop_price: dec!(9.50),
        take_profit_price: dec!(10.50),
        // Already elapsed: the monitor's first select! iteration fires
        // the time-stop branch immediately, with no tick required.
        max_hold_until: Utc::now() - chrono::Duration::seconds(1),
        status: PositionStatus::Open,
        origin_article_id: "article-7".to_string(),
        exit_price: None,
        exit_at: None,
        pnl: None,
    };
    store.open_position(&position).unwrap();

    let (position_tx, position_rx) = queue::stage_channel();
    let (notifier, mut complete_rx) = Notifier::new();
    let (shutdown, complete_tx) = notifier.subscribe();
    let supervisor_task = tokio::spawn(async move {
        position_supervisor.run(position_rx, shutdown).await;
        drop(complete_tx);
    });

    position_tx.send(position).await.unwrap();

    for _ in 0..200 {
        if store.list_open().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.list_open().unwrap().is_empty(), "time-stopped position should have closed");

    notifier.shutdown();
    drop(notifier);
    let _ = complete_rx.recv().await;
    let _ = supervisor_task.await;
}

#[tokio::test]
async fn fewer_than_ten_bars_never_signals() {
    let mut session = SimulatedSession::new();
    let symbol = Symbol::parse("IPO").unwrap();
    session.bars_by_symbol.insert(symbol.clone(), flat_bars(5));
    session.snapshot_by_symbol.insert(
        symbol.clone(),
        tapeshock::model::QuoteSnapshot {
            price: dec!(10.40),
            cum_volume: dec!(7000),
            as_of: Utc::now(),
        },
    );
    let (bridge, _worker) = spawn_bridge(session);

    let detection = Arc::new(DetectionStage::new(
        bridge,
        DetectionParams {
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown: Duration::from_secs(300),
        },
    ));
    let (ticker_tx, ticker_rx) = queue::stage_channel();
    let (signal_tx, mut signal_rx) = queue::stage_channel::<TradeSignal>();
    detection.spawn_workers(1, ticker_rx, signal_tx, lone_shutdown());

    ticker_tx
        .send(TickerEvent {
            symbol,
            article_id: "article-8".to_string(),
            published_at: Utc::now(),
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(500), signal_rx.recv()).await;
    assert!(result.is_err(), "fewer than 10 closed bars must never produce a signal");
}

#[tokio::test]
async fn duplicate_open_position_rejects_second_signal_for_same_symbol() {
    let mut session = SimulatedSession::new();
    let symbol = Symbol::parse("ORCL").unwrap();
    session.fill_price_by_symbol.insert(symbol.clone(), dec!(50.00));
    session.account_value = dec!(100_000);
    let (bridge, _worker) = spawn_bridge(session);

    let store: Arc<dyn TradeStore> = Arc::new(InMemoryTradeStore::new());
    let gate = opened_gate(bridge.clone(), store.clone()).await;

    let existing = Position {
        id: 1,
        symbol: symbol.clone(),
        direction: Direction::Long,
        qty: 10,
        entry_price: dec!(49.00),
        entry_at: Utc::now(),
        stop_price: dec!(47.00),
        take_profit_price: dec!(52.00),
        max_hold_until: Utc::now() + chrono::Duration::seconds(600),
        status: PositionStatus::Open,
        origin_article_id: "article-9".to_string(),
        exit_price: None,
        exit_at: None,
        pnl: None,
    };
    store.open_position(&existing).unwrap();

    let execution = Arc::new(ExecutionStage::new(bridge, gate, store.clone(), risk_params()));
    let (signal_tx, signal_rx) = queue::stage_channel();
    let (position_tx, mut position_rx) = queue::stage_channel();
    tokio::spawn(execution.run(signal_rx, position_tx, lone_shutdown()));

    signal_tx
        .send(TradeSignal {
            symbol: symbol.clone(),
            direction: Direction::Long,
            signal_price: dec!(50.40),
            stop_price: dec!(49.00),
            created_at: Utc::now(),
            origin_article_id: "article-10".to_string(),
        })
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(500), position_rx.recv()).await;
    assert!(result.is_err(), "a second position for the same symbol must be rejected");
    assert_eq!(
        store.list_open().unwrap().len(),
        1,
        "store should still only show the original position"
    );
}
