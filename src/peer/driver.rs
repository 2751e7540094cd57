//! Async glue that feeds a [`PeerConnection`] from its transport.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use super::codec::PeerMessage;
use super::connection::PeerConnection;
use super::error::CloseReason;

/// Runs a connection until it closes.
///
/// Decoded messages arrive on `rx`; the timer fires every `tick`. When the
/// sending half is dropped the transport is gone and the connection closes.
pub fn spawn_driver(
    conn: Arc<PeerConnection>,
    mut rx: mpsc::Receiver<PeerMessage>,
    tick: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer.tick().await;

        while !conn.is_closing() {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        // Fatal errors have already closed the connection.
                        let _ = conn.handle_at(msg, Instant::now().into_std());
                    }
                    None => {
                        debug!(peer = %conn.remote_addr(), "transport gone");
                        conn.close(CloseReason::local("transport closed"));
                    }
                },
                _ = timer.tick() => conn.on_timer(Instant::now().into_std()),
            }
        }
    })
}
