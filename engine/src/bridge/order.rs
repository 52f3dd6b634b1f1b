//! Order submission types.
//!
//! The engine only ever sends market orders (entries and opposite-side
//! exits), so this stays a deliberately small slice of what a full
//! order type would carry (limit prices, time-in-force, algo params).

use rust_decimal::Decimal;

use crate::bridge::contract::Contract;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub contract: Contract,
    pub action: Action,
    pub total_qty: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Submitted,
    PreSubmitted,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct OrderStatus {
    pub order_id: u64,
    pub state: OrderState,
    pub filled_qty: i64,
    pub avg_fill_price: Option<Decimal>,
}

impl OrderStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.state, OrderState::Filled | OrderState::Cancelled)
    }
}
