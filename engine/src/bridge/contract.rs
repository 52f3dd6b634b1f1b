//! Contract conventions used to address the vendor's instrument universe.
//!
//! Trimmed to the fields this engine actually addresses: equities and the
//! synthetic news "instrument" used for the broad-tape subscription.

use crate::model::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecType {
    Stock,
    News,
}

/// A contract identifies what the bridge is requesting data for, or placing
/// an order against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Contract {
    pub symbol: String,
    pub sec_type: SecType,
    pub exchange: String,
    pub currency: String,
    pub primary_exchange: Option<String>,
}

impl Contract {
    /// Equity contract: `{symbol, secType: "STK", exchange: "SMART",
    /// currency: "USD", primaryExchange: configured default}`.
    #[must_use]
    pub fn equity(symbol: &Symbol, primary_exchange: &str) -> Self {
        Self {
            symbol: symbol.as_str().to_string(),
            sec_type: SecType::Stock,
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            primary_exchange: Some(primary_exchange.to_string()),
        }
    }

    /// News subscription contract: `{symbol: "{P}:{P}_ALL", secType:
    /// "NEWS", exchange: "{P}"}` where `P` is the provider code.
    #[must_use]
    pub fn news_provider(provider_code: &str) -> Self {
        Self {
            symbol: format!("{provider_code}:{provider_code}_ALL"),
            sec_type: SecType::News,
            exchange: provider_code.to_string(),
            currency: "USD".to_string(),
            primary_exchange: None,
        }
    }
}

/// Generic tick list used for the news broad-tape subscription.
pub const NEWS_GENERIC_TICK_LIST: &str = "292";
