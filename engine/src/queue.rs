//! Stage-to-stage queues (§5).
//!
//! Every inter-stage handoff (news → detection → execution → position
//! supervisor) is a bounded `tokio::sync::mpsc` channel of capacity
//! 1024 that blocks its producer when full; only the raw `Tick` path
//! from the bridge worker uses the drop-oldest `crossbeam_channel`
//! policy, handled directly in [`crate::bridge`]. This module exists so
//! every stage constructs its queues the same way instead of repeating
//! the capacity constant.

use tokio::sync::mpsc;

/// Capacity shared by every bounded inter-stage queue (§5).
pub const STAGE_QUEUE_CAPACITY: usize = 1024;

/// A bounded sender/receiver pair sized per §5's stage-queue capacity.
#[must_use]
pub fn stage_channel<T>() -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(STAGE_QUEUE_CAPACITY)
}
