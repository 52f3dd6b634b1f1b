//! The blocking vendor session abstraction.
//!
//! The real TWS-style wire protocol (framing, per-field encode/decode) is
//! out of budget — §6 says the bridge need not re-implement it.
//! `VendorSession` is the seam: an implementation owns a single blocking,
//! callback-driven connection and is only ever driven from the bridge's
//! dedicated worker thread (§5).

use crate::bridge::{BrokerEvent, BrokerRequest};
use crate::{ClientId, Result};

/// A blocking vendor session. Every method may block the calling thread;
/// callers must only invoke these from the bridge's dedicated worker.
pub trait VendorSession: Send {
    /// Perform the connection handshake. Blocks until acknowledged or
    /// failed.
    fn connect(&mut self, host: &str, port: u16, client_id: ClientId) -> Result<()>;

    /// Submit a single outbound request. Non-blocking: the vendor library
    /// queues the wire write and responses arrive later via `poll_event`.
    fn submit(&mut self, request: &BrokerRequest) -> Result<()>;

    /// Cancel a previously submitted subscription/request, if the vendor
    /// supports cancellation for its kind.
    fn cancel(&mut self, req_id: crate::RequestId) -> Result<()>;

    /// Block for up to `timeout` waiting for the next event. Returns
    /// `Ok(None)` on a plain timeout (no event ready, not an error) so the
    /// worker thread can still interleave outbound submissions between
    /// polls.
    fn poll_event(&mut self, timeout: std::time::Duration) -> Result<Option<BrokerEvent>>;

    /// Tear down the session.
    fn disconnect(&mut self) -> Result<()>;
}

#[cfg(any(test, feature = "simulated-session"))]
pub mod simulated {
    //! A scripted [`VendorSession`] used by tests and `--dry-run`. Configured
    //! with canned per-symbol fixtures, it auto-responds to each `submit`
    //! correlated by the request's own `req_id`, playing the same role a
    //! live connection would in an end-to-end test but without requiring
    //! one.

    use std::collections::{HashMap, VecDeque};

    use rust_decimal::Decimal;

    use crate::bridge::order::{OrderState, OrderStatus};
    use crate::bridge::{BrokerEvent, BrokerEventKind, BrokerRequest, BrokerRequestKind, Tick};
    use crate::model::{Bar, QuoteSnapshot, Symbol};
    use crate::{ClientId, RequestId, Result};

    use super::VendorSession;

    #[derive(Debug, Default)]
    pub struct SimulatedSession {
        pub connected: bool,
        pending: VecDeque<BrokerEvent>,
        pub bars_by_symbol: HashMap<Symbol, Vec<Bar>>,
        pub snapshot_by_symbol: HashMap<Symbol, QuoteSnapshot>,
        pub fill_price_by_symbol: HashMap<Symbol, Decimal>,
        pub account_value: Decimal,
        pub broker_positions: Vec<(Symbol, i64)>,
        pub submitted: Vec<BrokerRequest>,
        pub cancelled: Vec<RequestId>,
    }

    impl SimulatedSession {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue an unsolicited event (news, streamed ticks, connection
        /// loss) for the next `poll_event`.
        pub fn push_unsolicited(&mut self, kind: BrokerEventKind) -> &mut Self {
            self.pending.push_back(BrokerEvent { req_id: 0, kind });
            self
        }
    }

    impl VendorSession for SimulatedSession {
        fn connect(&mut self, _host: &str, _port: u16, _client_id: ClientId) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        fn submit(&mut self, request: &BrokerRequest) -> Result<()> {
            self.submitted.push(request.clone());
            let req_id = request.req_id;
            match &request.kind {
                BrokerRequestKind::Connect { .. } => {}
                BrokerRequestKind::HistBars { symbol, count, .. } => {
                    let bars = self
                        .bars_by_symbol
                        .get(symbol)
                        .cloned()
                        .unwrap_or_default();
                    for bar in bars.into_iter().take(*count) {
                        self.pending.push_back(BrokerEvent {
                            req_id,
                            kind: BrokerEventKind::HistoricalBar(bar),
                        });
                    }
                    self.pending.push_back(BrokerEvent {
                        req_id,
                        kind: BrokerEventKind::HistoricalBarsEnd,
                    });
                }
                BrokerRequestKind::MktSnapshot { symbol } => {
                    if let Some(snap) = self.snapshot_by_symbol.get(symbol) {
                        self.pending.push_back(BrokerEvent {
                            req_id,
                            kind: BrokerEventKind::Tick(Tick {
                                symbol: symbol.clone(),
                                price: snap.price,
                                cum_volume: snap.cum_volume,
                                ts: snap.as_of,
                            }),
                        });
                    }
                }
                BrokerRequestKind::StreamQuote { .. } => {}
                BrokerRequestKind::PlaceOrder { order } => {
                    let price = self
                        .fill_price_by_symbol
                        .get(&Symbol::parse(&order.contract.symbol).expect("valid symbol"))
                        .copied()
                        .unwrap_or_default();
                    self.pending.push_back(BrokerEvent {
                        req_id,
                        kind: BrokerEventKind::OrderStatus(OrderStatus {
                            order_id: req_id,
                            state: OrderState::Submitted,
                            filled_qty: 0,
                            avg_fill_price: None,
                        }),
                    });
                    self.pending.push_back(BrokerEvent {
                        req_id,
                        kind: BrokerEventKind::OrderStatus(OrderStatus {
                            order_id: req_id,
                            state: OrderState::Filled,
                            filled_qty: order.total_qty,
                            avg_fill_price: Some(price),
                        }),
                    });
                }
                BrokerRequestKind::CancelOrder { .. } | BrokerRequestKind::SubscribeNews { .. } => {}
                BrokerRequestKind::AccountSummary => {
                    self.pending.push_back(BrokerEvent {
                        req_id,
                        kind: BrokerEventKind::AccountValue(self.account_value),
                    });
                }
                BrokerRequestKind::Positions => {
                    for (symbol, qty) in &self.broker_positions {
                        self.pending.push_back(BrokerEvent {
                            req_id,
                            kind: BrokerEventKind::PositionReport {
                                symbol: symbol.clone(),
                                qty: *qty,
                            },
                        });
                    }
                    self.pending.push_back(BrokerEvent {
                        req_id,
                        kind: BrokerEventKind::PositionsEnd,
                    });
                }
            }
            Ok(())
        }

        fn cancel(&mut self, req_id: crate::RequestId) -> Result<()> {
            self.cancelled.push(req_id);
            Ok(())
        }

        fn poll_event(&mut self, _timeout: std::time::Duration) -> Result<Option<BrokerEvent>> {
            Ok(self.pending.pop_front())
        }

        fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }
    }
}
