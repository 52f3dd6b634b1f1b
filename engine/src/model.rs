//! Core data types shared by every stage.
//!
//! Prices and PnL are `Decimal` throughout; quantities are integer shares.
//! Floating point is reserved for the shock-detection ratios in
//! [`stages::detection`](crate::stages::detection), which are dimensionless.

use std::fmt;

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::TimeStamp;

/// A symbol must match `[A-Z][A-Z0-9.\-]{0,9}`.
fn symbol_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9.\-]{0,9}$").unwrap())
}

/// Validate and wrap a ticker symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(raw: &str) -> Option<Self> {
        let candidate = raw.trim().to_ascii_uppercase();
        symbol_pattern()
            .is_match(&candidate)
            .then_some(Self(candidate))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A news article's ID, as assigned by the broker's news provider.
pub type ArticleId = String;

/// A single closed or in-progress minute bar.
#[derive(Debug, Clone, Copy)]
pub struct Bar {
    pub ts: TimeStamp,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// The coherent price+volume pair the bridge returns for `snapshotQuote`.
#[derive(Debug, Clone, Copy)]
pub struct QuoteSnapshot {
    pub price: Decimal,
    pub cum_volume: Decimal,
    pub as_of: TimeStamp,
}

/// Emitted by the News Stage once a single best ticker has been resolved
/// for an article.
#[derive(Debug, Clone)]
pub struct TickerEvent {
    pub symbol: Symbol,
    pub article_id: ArticleId,
    pub published_at: TimeStamp,
    pub received_at: TimeStamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for Long, -1 for Short — used in the PnL round-trip law.
    #[must_use]
    pub const fn sign(self) -> i64 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }
}

/// Emitted by the Detection Stage when both the price and volume shock
/// conditions hold simultaneously.
#[derive(Debug, Clone)]
pub struct TradeSignal {
    pub symbol: Symbol,
    pub direction: Direction,
    pub signal_price: Decimal,
    pub stop_price: Decimal,
    pub created_at: TimeStamp,
    pub origin_article_id: ArticleId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    StuckClosing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TimeStop,
    StopLoss,
    TakeProfit,
}

/// An open, closing, or closed trade, owned exclusively by the Position
/// Supervisor once handed off by the Execution Stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub symbol: Symbol,
    pub direction: Direction,
    pub qty: i64,
    pub entry_price: Decimal,
    pub entry_at: TimeStamp,
    pub stop_price: Decimal,
    pub take_profit_price: Decimal,
    pub max_hold_until: TimeStamp,
    pub status: PositionStatus,
    pub origin_article_id: ArticleId,
    pub exit_price: Option<Decimal>,
    pub exit_at: Option<TimeStamp>,
    pub pnl: Option<Decimal>,
}

impl Position {
    /// `pnl = sign(direction) * (exit - entry) * qty`, computed exactly in
    /// fixed-precision decimal (the round-trip law in §8).
    #[must_use]
    pub fn realize(&mut self, exit_price: Decimal, exit_at: TimeStamp) -> Decimal {
        let sign = Decimal::from(self.direction.sign());
        let pnl = sign * (exit_price - self.entry_price) * Decimal::from(self.qty);
        self.exit_price = Some(exit_price);
        self.exit_at = Some(exit_at);
        self.pnl = Some(pnl);
        self.status = PositionStatus::Closed;
        pnl
    }
}

/// Account summary value tracked by the Execution Stage for sizing.
#[derive(Debug, Clone, Copy)]
pub struct AccountSummary {
    pub account_value: Decimal,
    pub as_of: TimeStamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ticker() {
        assert!(Symbol::parse("AAPL").is_some());
        assert_eq!(Symbol::parse("aapl").unwrap().as_str(), "AAPL");
    }

    #[test]
    fn accepts_class_and_dot_suffixes() {
        assert!(Symbol::parse("BRK.B").is_some());
        assert!(Symbol::parse("BF-B").is_some());
    }

    #[test]
    fn rejects_leading_digit_and_empty() {
        assert!(Symbol::parse("1AAPL").is_none());
        assert!(Symbol::parse("").is_none());
        assert!(Symbol::parse("TOOLONGSYMBOL1").is_none());
    }

    #[test]
    fn pnl_round_trip_long() {
        use chrono::Utc;
        use rust_decimal_macros::dec;
        let mut pos = Position {
            id: 1,
            symbol: Symbol::parse("KITT").unwrap(),
            direction: Direction::Long,
            qty: 2000,
            entry_price: dec!(10.40),
            entry_at: Utc::now(),
            stop_price: dec!(9.90),
            take_profit_price: dec!(10.61),
            max_hold_until: Utc::now(),
            status: PositionStatus::Open,
            origin_article_id: "a1".into(),
            exit_price: None,
            exit_at: None,
            pnl: None,
        };
        let pnl = pos.realize(dec!(10.60), Utc::now());
        assert_eq!(pnl, dec!(400.00));
        assert_eq!(pos.status, PositionStatus::Closed);
    }

    #[test]
    fn pnl_round_trip_short() {
        use chrono::Utc;
        use rust_decimal_macros::dec;
        let mut pos = Position {
            id: 2,
            symbol: Symbol::parse("KITT").unwrap(),
            direction: Direction::Short,
            qty: 100,
            entry_price: dec!(50.00),
            entry_at: Utc::now(),
            stop_price: dec!(52.00),
            take_profit_price: dec!(48.00),
            max_hold_until: Utc::now(),
            status: PositionStatus::Open,
            origin_article_id: "a2".into(),
            exit_price: None,
            exit_at: None,
            pnl: None,
        };
        let pnl = pos.realize(dec!(49.00), Utc::now());
        assert_eq!(pnl, dec!(100.00));
    }
}
