//! Connection Supervisor (§4.C).
//!
//! Drives the broker session lifecycle: `Disconnected → Connecting →
//! Syncing → Operational → Degraded`, with exponential jittered backoff
//! on failure and a sync checklist run once per successful connect. The
//! gate — a single boolean the execution stage reads immediately before
//! every order submission — is only ever opened at the end of a
//! successful sync.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::bridge::{Bridge, ConnectionStatus};
use crate::shutdown::Shutdown;
use crate::store::TradeStore;
use crate::{ClientId, Result};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACCOUNT_TIMEOUT: Duration = Duration::from_secs(2);
const POSITIONS_TIMEOUT: Duration = Duration::from_secs(5);
const DEGRADED_COOLDOWN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Syncing,
    Operational,
    Degraded,
}

/// The single boolean the execution stage must read, under no held
/// lock of its own, immediately before submitting an order.
#[derive(Debug, Clone)]
pub struct Gate(Arc<AtomicBool>);

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, open: bool) {
        self.0.store(open, Ordering::Release);
    }
}

/// Callback invoked after every successful reconnect (steps 2-4 of the
/// sync checklist the supervisor itself doesn't own the state for:
/// re-subscribing news and resuming quote streams). Step 1 (position
/// reconciliation) is handled by the supervisor directly against the
/// trade store and the broker's reported positions.
pub type ResumeHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

pub struct ConnectionSupervisor {
    bridge: Bridge,
    store: Arc<dyn TradeStore>,
    gate: Gate,
    host: String,
    port: u16,
    client_id: ClientId,
    on_sync: ResumeHook,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(
        bridge: Bridge,
        store: Arc<dyn TradeStore>,
        host: impl Into<String>,
        port: u16,
        client_id: ClientId,
        on_sync: ResumeHook,
    ) -> Self {
        Self {
            bridge,
            store,
            gate: Gate::new(),
            host: host.into(),
            port,
            client_id,
            on_sync,
        }
    }

    #[must_use]
    pub fn gate(&self) -> Gate {
        self.gate.clone()
    }

    /// Runs the state machine until `shutdown` resolves. The gate
    /// reflects `Operational` at every point observers can read it.
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut state = State::Disconnected;
        let mut attempt: u32 = 0;
        let mut status_rx = self.bridge.subscribe_status();

        loop {
            if shutdown.is_shutdown() {
                return;
            }
            state = match state {
                State::Disconnected => {
                    info!("connecting to broker");
                    State::Connecting
                }
                State::Connecting => {
                    tokio::select! {
                        result = self.bridge.connect(&self.host, self.port, self.client_id, CONNECT_TIMEOUT) => {
                            match result {
                                Ok(()) => {
                                    attempt = 0;
                                    State::Syncing
                                }
                                Err(err) => {
                                    warn!(%err, "connect failed");
                                    self.backoff(&mut attempt, &mut shutdown).await;
                                    State::Disconnected
                                }
                            }
                        }
                        () = shutdown.recv() => return,
                    }
                }
                State::Syncing => match self.run_sync_checklist().await {
                    Ok(()) => {
                        self.gate.set(true);
                        info!("sync checklist complete, gate open");
                        State::Operational
                    }
                    Err(err) => {
                        error!(%err, "sync checklist failed");
                        self.gate.set(false);
                        self.backoff(&mut attempt, &mut shutdown).await;
                        State::Disconnected
                    }
                },
                State::Operational => {
                    tokio::select! {
                        status = status_rx.recv() => {
                            match status {
                                Ok(ConnectionStatus::Closed) => {
                                    warn!("connection closed, entering degraded state");
                                    self.gate.set(false);
                                    State::Degraded
                                }
                                Ok(ConnectionStatus::StoreFault) => {
                                    error!("trade store write failed, entering degraded state, operator intervention required");
                                    self.gate.set(false);
                                    State::Degraded
                                }
                                Ok(ConnectionStatus::Ack) | Err(_) => State::Operational,
                            }
                        }
                        () = shutdown.recv() => return,
                    }
                }
                State::Degraded => {
                    tokio::select! {
                        () = sleep(DEGRADED_COOLDOWN) => State::Connecting,
                        () = shutdown.recv() => return,
                    }
                }
            };
        }
    }

    async fn backoff(&self, attempt: &mut u32, shutdown: &mut Shutdown) {
        let exp = BACKOFF_BASE.saturating_mul(1u32.checked_shl(*attempt).unwrap_or(u32::MAX));
        let capped = exp.min(BACKOFF_CAP);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
        let delay = capped + Duration::from_millis(jitter_ms);
        *attempt = attempt.saturating_add(1);
        tokio::select! {
            () = sleep(delay) => {}
            () = shutdown.recv() => {}
        }
    }

    /// (1) reconcile open positions, (2) re-subscribe news + (4) resume
    /// quote streams (delegated to `on_sync`), (3) re-request account
    /// summary.
    async fn run_sync_checklist(&self) -> Result<()> {
        self.reconcile_positions().await?;
        (self.on_sync)()?;
        self.bridge.account_summary(ACCOUNT_TIMEOUT).await?;
        Ok(())
    }

    async fn reconcile_positions(&self) -> Result<()> {
        let stored = self.store.list_open()?;
        let reported = self.bridge.fetch_positions(POSITIONS_TIMEOUT).await?;
        for position in &stored {
            let broker_qty = reported
                .iter()
                .find(|(symbol, _)| *symbol == position.symbol)
                .map(|(_, qty)| *qty);
            match broker_qty {
                Some(qty) if qty == position.qty => {
                    info!(symbol = %position.symbol, qty, "position reconciled");
                }
                Some(qty) => {
                    warn!(
                        symbol = %position.symbol,
                        stored = position.qty,
                        broker = qty,
                        "position quantity mismatch on reconnect"
                    );
                }
                None => {
                    warn!(symbol = %position.symbol, "stored open position not reported by broker");
                }
            }
        }
        Ok(())
    }
}
