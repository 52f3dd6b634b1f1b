//! Durable trade record storage (§6).
//!
//! Opaque to the core: `openPosition`, `closePosition`, `listOpen`.
//! Accessed serially from the execution stage and the position
//! supervisor; required to be crash-consistent at the statement level.
//! Two implementations: an in-memory one for tests, and a
//! newline-delimited JSON file, opened append-only and fsynced per
//! write, for production.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::Position;
use crate::{EngineError, Result, TimeStamp};

/// A single durable record: either a position being opened, or a
/// previously open position being closed. Appending these two record
/// kinds in order reconstructs the full open/closed history on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum Record {
    Open {
        position: Position,
    },
    Close {
        id: u64,
        exit_price: Decimal,
        exit_at: TimeStamp,
        pnl: Decimal,
    },
}

/// Durable trade record collaborator. Implementations must serialize
/// concurrent writers themselves; callers (F and G) already access it
/// serially per §5, but the trait makes no such assumption.
pub trait TradeStore: Send + Sync {
    fn open_position(&self, position: &Position) -> Result<()>;
    fn close_position(&self, id: u64, exit_price: Decimal, exit_at: TimeStamp, pnl: Decimal) -> Result<()>;
    fn list_open(&self) -> Result<Vec<Position>>;
}

fn close_in_place(position: &mut Position, exit_price: Decimal, exit_at: TimeStamp, pnl: Decimal) {
    position.exit_price = Some(exit_price);
    position.exit_at = Some(exit_at);
    position.pnl = Some(pnl);
    position.status = crate::model::PositionStatus::Closed;
}

/// In-memory store. Used by unit and integration tests; nothing is
/// persisted across a process restart.
#[derive(Debug, Default)]
pub struct InMemoryTradeStore {
    positions: Mutex<HashMap<u64, Position>>,
}

impl InMemoryTradeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Position>> {
        self.positions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TradeStore for InMemoryTradeStore {
    fn open_position(&self, position: &Position) -> Result<()> {
        self.lock().insert(position.id, position.clone());
        Ok(())
    }

    fn close_position(&self, id: u64, exit_price: Decimal, exit_at: TimeStamp, pnl: Decimal) -> Result<()> {
        if let Some(position) = self.lock().get_mut(&id) {
            close_in_place(position, exit_price, exit_at, pnl);
        }
        Ok(())
    }

    fn list_open(&self) -> Result<Vec<Position>> {
        Ok(self
            .lock()
            .values()
            .filter(|p| p.status != crate::model::PositionStatus::Closed)
            .cloned()
            .collect())
    }
}

/// Append-only newline-delimited JSON store. Every write appends one
/// `Record` and fsyncs before returning, so a crash mid-write leaves at
/// worst a truncated trailing line, which replay on load tolerates by
/// discarding it.
#[derive(Debug)]
pub struct NdjsonTradeStore {
    file: Mutex<File>,
    positions: Mutex<HashMap<u64, Position>>,
}

impl NdjsonTradeStore {
    /// Opens (creating if absent) the NDJSON file at `path` and replays
    /// it to reconstruct current open-position state.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut positions = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(
                File::open(path).map_err(|e| EngineError::StoreFailure(e.to_string()))?,
            );
            for line in reader.lines() {
                let line = line.map_err(|e| EngineError::StoreFailure(e.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(record) = serde_json::from_str::<Record>(&line) else {
                    // A truncated trailing line from a crash mid-write;
                    // every prior line is a complete statement.
                    continue;
                };
                apply(&mut positions, record);
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EngineError::StoreFailure(e.to_string()))?;
        Ok(Self {
            file: Mutex::new(file),
            positions: Mutex::new(positions),
        })
    }

    fn append(&self, record: &Record) -> Result<()> {
        let line = serde_json::to_string(record).map_err(|e| EngineError::StoreFailure(e.to_string()))?;
        let mut file = self.file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        writeln!(file, "{line}").map_err(|e| EngineError::StoreFailure(e.to_string()))?;
        file.sync_data().map_err(|e| EngineError::StoreFailure(e.to_string()))?;
        Ok(())
    }

    fn positions(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Position>> {
        self.positions.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn apply(positions: &mut HashMap<u64, Position>, record: Record) {
    match record {
        Record::Open { position } => {
            positions.insert(position.id, position);
        }
        Record::Close {
            id,
            exit_price,
            exit_at,
            pnl,
        } => {
            if let Some(position) = positions.get_mut(&id) {
                close_in_place(position, exit_price, exit_at, pnl);
            }
        }
    }
}

impl TradeStore for NdjsonTradeStore {
    fn open_position(&self, position: &Position) -> Result<()> {
        self.append(&Record::Open {
            position: position.clone(),
        })?;
        self.positions().insert(position.id, position.clone());
        Ok(())
    }

    fn close_position(&self, id: u64, exit_price: Decimal, exit_at: TimeStamp, pnl: Decimal) -> Result<()> {
        self.append(&Record::Close {
            id,
            exit_price,
            exit_at,
            pnl,
        })?;
        if let Some(position) = self.positions().get_mut(&id) {
            close_in_place(position, exit_price, exit_at, pnl);
        }
        Ok(())
    }

    fn list_open(&self) -> Result<Vec<Position>> {
        Ok(self
            .positions()
            .values()
            .filter(|p| p.status != crate::model::PositionStatus::Closed)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, PositionStatus, Symbol};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_position(id: u64) -> Position {
        Position {
            id,
            symbol: Symbol::parse("TSLA").unwrap(),
            direction: Direction::Long,
            qty: 100,
            entry_price: dec!(200.00),
            entry_at: Utc::now(),
            stop_price: dec!(195.00),
            take_profit_price: dec!(210.00),
            max_hold_until: Utc::now() + chrono::Duration::seconds(600),
            status: PositionStatus::Open,
            origin_article_id: "article-1".to_string(),
            exit_price: None,
            exit_at: None,
            pnl: None,
        }
    }

    #[test]
    fn in_memory_round_trips_open_and_close() {
        let store = InMemoryTradeStore::new();
        let position = sample_position(1);
        store.open_position(&position).unwrap();
        assert_eq!(store.list_open().unwrap().len(), 1);
        store.close_position(1, dec!(205.00), Utc::now(), dec!(500.00)).unwrap();
        assert!(store.list_open().unwrap().is_empty());
    }

    #[test]
    fn ndjson_replays_open_positions_after_reopen() {
        let dir = std::env::temp_dir().join(format!("tapeshock-store-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.ndjson");
        {
            let store = NdjsonTradeStore::open(&path).unwrap();
            store.open_position(&sample_position(1)).unwrap();
        }
        let reopened = NdjsonTradeStore::open(&path).unwrap();
        assert_eq!(reopened.list_open().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn ndjson_closed_position_drops_out_of_listing_after_replay() {
        let dir = std::env::temp_dir().join(format!("tapeshock-store-test-close-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.ndjson");
        {
            let store = NdjsonTradeStore::open(&path).unwrap();
            store.open_position(&sample_position(1)).unwrap();
            store.close_position(1, dec!(205.00), Utc::now(), dec!(500.00)).unwrap();
        }
        let reopened = NdjsonTradeStore::open(&path).unwrap();
        assert!(reopened.list_open().unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
