use std::time::Instant;
use tracing::{info, trace};

use super::{Action, ConnectionState, PeerConnection};
use crate::peer::error::{CloseReason, PeerError};
use crate::peer::message::Message;
use crate::peer::tuning::tune;

impl PeerConnection {
    /// Periodic housekeeping, driven once a second or so.
    ///
    /// Enforces the handshake and idle timeouts, keeps the link alive,
    /// releases withheld haves and retunes the transport.
    pub fn on_timer(&self, now: Instant) {
        if self.is_closing() {
            return;
        }
        if let Err(err) = self.tick(now) {
            info!(peer = %self.addr, error = %err, "closing connection");
            self.close_at(CloseReason::from(&err), now);
        }
        self.ctx.services.reconnects.clean(now);
    }

    fn tick(&self, now: Instant) -> Result<(), PeerError> {
        let config = &self.ctx.config;
        let transport = &self.ctx.transport;
        let tuning_rates = (transport.send_rate(), transport.receive_rate());
        let superseeding = self.ctx.manager.is_superseeding();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // The clock may have been observed out of order by other callers.
        for stamp in [&mut inner.last_message_received, &mut inner.last_sent] {
            if *stamp > now {
                *stamp = now;
            }
        }
        let since = |t: Instant| now.saturating_duration_since(t);

        match inner.state {
            ConnectionState::Connecting
            | ConnectionState::WaitingForHandshake
            | ConnectionState::Handshaking => {
                if since(inner.connected_at) >= config.handshake_timeout() {
                    return Err(PeerError::HandshakeTimeout);
                }
                return Ok(());
            }
            ConnectionState::Transferring => {}
            ConnectionState::Closing | ConnectionState::Disconnected => return Ok(()),
        }

        let idle = config.idle_timeout();
        let last_data = inner
            .last_data_received
            .or(inner.established_at)
            .unwrap_or(inner.connected_at);
        if since(inner.last_message_received) >= idle && since(last_data) >= idle {
            return Err(PeerError::IdleTimeout(idle.as_secs()));
        }

        if since(inner.last_sent) >= config.keep_alive_interval() {
            trace!(peer = %self.addr, "keep-alive");
            inner.send(Message::KeepAlive, now);
        }

        while inner.lazy_haves.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, piece)) = inner.lazy_haves.pop_front() {
                if !superseeding {
                    inner.send(Message::Have(piece), now);
                }
            }
        }

        if inner.request_hint.is_some_and(|(_, expires)| expires <= now) {
            inner.request_hint = None;
        }

        let (send_rate, receive_rate) = tuning_rates;
        let tuning = tune(inner.transport_mode, send_rate, receive_rate);
        if tuning.mode != inner.transport_mode {
            trace!(peer = %self.addr, mode = ?tuning.mode, "transport mode raised");
            inner.transport_mode = tuning.mode;
            inner.push(Action::SetMode(tuning.mode));
        }
        inner.read_ahead = tuning.read_ahead;

        self.flush_guard(guard);
        Ok(())
    }
}

