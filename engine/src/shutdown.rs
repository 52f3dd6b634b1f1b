//! Graceful shutdown plumbing.
//!
//! Layers a [`CancellationToken`] (cheap to clone and check from any
//! stage's select loop) under a `broadcast`-based `Shutdown` listener
//! and a `shutdown_complete` drain channel, mirroring the
//! listener/handler shutdown pattern: `main` holds the sole
//! `shutdown_complete_tx`; every spawned task holds a clone and drops it
//! on exit, so `main` can await every task's completion by waiting for
//! the channel to close.

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Per-task shutdown listener. Cloned into every stage; `recv` resolves
/// once, the first time a shutdown is signalled.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
    pub token: CancellationToken,
}

impl Shutdown {
    #[must_use]
    pub fn new(notify: broadcast::Receiver<()>, token: CancellationToken) -> Self {
        Self {
            is_shutdown: false,
            notify,
            token,
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Resolves once a shutdown has been signalled. Idempotent: calling
    /// it again after the first resolution returns immediately.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            is_shutdown: self.is_shutdown,
            notify: self.notify.resubscribe(),
            token: self.token.clone(),
        }
    }
}

/// Owns the signalling half of shutdown. `main` holds exactly one of
/// these; dropping it (after calling [`Notifier::shutdown`]) and then
/// awaiting `shutdown_complete_rx.recv()` on the paired
/// `mpsc::Receiver` until it returns `None` is how `main` knows every
/// task has drained.
#[derive(Debug)]
pub struct Notifier {
    notify_shutdown: broadcast::Sender<()>,
    token: CancellationToken,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Notifier {
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        (
            Self {
                notify_shutdown,
                token: CancellationToken::new(),
                shutdown_complete_tx,
            },
            shutdown_complete_rx,
        )
    }

    /// A listener for one task, plus a clone of the completion sender
    /// that task must hold until it finishes draining.
    #[must_use]
    pub fn subscribe(&self) -> (Shutdown, mpsc::Sender<()>) {
        (
            Shutdown::new(self.notify_shutdown.subscribe(), self.token.clone()),
            self.shutdown_complete_tx.clone(),
        )
    }

    /// Broadcasts the shutdown signal and cancels the token. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
        let _ = self.notify_shutdown.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_resolves_after_shutdown_signal() {
        let (notifier, mut complete_rx) = Notifier::new();
        let (mut shutdown, complete_tx) = notifier.subscribe();
        assert!(!shutdown.is_shutdown());
        notifier.shutdown();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        assert!(shutdown.token.is_cancelled());
        drop(notifier);
        drop(complete_tx);
        assert!(complete_rx.recv().await.is_none());
    }
}
