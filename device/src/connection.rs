//! Lifecycle of the single logical broker connection.
//!
//! Connect attempts run as spawned tasks and report back over a channel the
//! controller drains. Every attempt carries a `Ticket` naming the
//! configuration epoch it was started under; results from an older epoch,
//! or that arrive after reconnection was disabled, are closed instead of
//! adopted. At most one attempt is in flight at a time.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnector, BrokerSession, DisconnectSignal};
use crate::config::TrackerConfig;
use crate::error::ConnectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Identifies one connect attempt and the epoch it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub epoch: u64,
    pub attempt: u64,
}

pub enum ConnectionEvent {
    AttemptFinished {
        ticket: Ticket,
        result: Result<Arc<dyn BrokerSession>, ConnectError>,
    },
    Dropped {
        ticket: Ticket,
        reason: String,
    },
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::AttemptFinished { ticket, result } => f
                .debug_struct("AttemptFinished")
                .field("ticket", ticket)
                .field("ok", &result.is_ok())
                .finish(),
            ConnectionEvent::Dropped { ticket, reason } => f
                .debug_struct("Dropped")
                .field("ticket", ticket)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// What the controller should do after a connection event was applied.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// A fresh session is now current; flush the queue.
    Adopted,
    /// A stale result was torn down.
    Discarded,
    Failed(String),
    /// The current session dropped. `reconnect` is true when another
    /// attempt should be started.
    Lost { reason: String, reconnect: bool },
    Ignored,
}

struct ActiveSession {
    ticket: Ticket,
    session: Arc<dyn BrokerSession>,
}

/// Reports an attempt's result exactly once, even if the attempt task is
/// cancelled or panics before finishing.
struct AttemptReport {
    ticket: Ticket,
    tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl AttemptReport {
    fn finish(mut self, result: Result<Arc<dyn BrokerSession>, ConnectError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ConnectionEvent::AttemptFinished {
                ticket: self.ticket,
                result,
            });
        }
    }
}

impl Drop for AttemptReport {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ConnectionEvent::AttemptFinished {
                ticket: self.ticket,
                result: Err(ConnectError::Aborted),
            });
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connect_timeout: Duration,
    state: ConnectionState,
    epoch: u64,
    next_attempt: u64,
    in_flight: Option<u64>,
    reconnect_enabled: bool,
    current: Option<ActiveSession>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        connect_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager {
            connector,
            events_tx,
            connect_timeout,
            state: ConnectionState::Disconnected,
            epoch: 0,
            next_attempt: 0,
            in_flight: None,
            reconnect_enabled: false,
            current: None,
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.current.is_some()
    }

    pub fn attempt_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_enabled
    }

    pub fn session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.current.as_ref().map(|active| active.session.clone())
    }

    /// Invalidates every attempt started so far.
    pub fn advance_epoch(&mut self) -> u64 {
        self.epoch += 1;
        // results of older attempts are discarded on arrival, so a new
        // activation must not wait for them
        self.in_flight = None;
        self.epoch
    }

    pub fn enable_reconnect(&mut self) {
        self.reconnect_enabled = true;
    }

    pub fn disable_reconnect(&mut self) {
        self.reconnect_enabled = false;
    }

    /// Starts a connect attempt unless reconnection is off, no config is
    /// active, or an attempt is already running. `delay` is waited inside
    /// the attempt before dialling. Returns whether an attempt was started.
    pub fn ensure_connected(
        &mut self,
        config: Option<&Arc<TrackerConfig>>,
        delay: Duration,
    ) -> bool {
        let Some(config) = config else {
            return false;
        };
        if !self.reconnect_enabled || self.in_flight.is_some() || self.is_connected() {
            return false;
        }

        self.next_attempt += 1;
        let ticket = Ticket {
            epoch: self.epoch,
            attempt: self.next_attempt,
        };
        self.in_flight = Some(ticket.attempt);
        self.state = ConnectionState::Connecting;

        info!(
            epoch = ticket.epoch,
            attempt = ticket.attempt,
            broker = %config.broker,
            port = config.port,
            "Starting broker connect attempt"
        );

        let connector = self.connector.clone();
        let config = config.clone();
        let tx = self.events_tx.clone();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let report = AttemptReport {
                ticket,
                tx: Some(tx.clone()),
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let (signal, dropped) = DisconnectSignal::pair();
            let attempt = connector.connect(&config, signal);
            let result = match tokio::time::timeout(connect_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(connect_timeout.as_secs())),
            };
            report.finish(result);

            // Relay the transport drop callback. An unfired signal means the
            // session was closed on purpose or never adopted.
            if let Ok(reason) = dropped.await {
                let _ = tx.send(ConnectionEvent::Dropped { ticket, reason });
            }
        });

        true
    }

    /// Applies a connection event. Stale sessions are closed here.
    pub async fn handle_event(&mut self, event: ConnectionEvent) -> ConnectionOutcome {
        match event {
            ConnectionEvent::AttemptFinished { ticket, result } => {
                if self.in_flight == Some(ticket.attempt) {
                    self.in_flight = None;
                }
                let stale = ticket.epoch != self.epoch || !self.reconnect_enabled;

                match result {
                    Ok(session) if stale => {
                        debug!(
                            attempt_epoch = ticket.epoch,
                            current_epoch = self.epoch,
                            "Discarding connection from stale attempt"
                        );
                        session.close().await;
                        ConnectionOutcome::Discarded
                    }
                    Ok(session) => {
                        // replaces any leftover session
                        if let Some(previous) = self.current.take() {
                            previous.session.close().await;
                        }
                        self.current = Some(ActiveSession { ticket, session });
                        self.state = ConnectionState::Connected;
                        info!(
                            epoch = ticket.epoch,
                            attempt = ticket.attempt,
                            "Broker connection adopted"
                        );
                        ConnectionOutcome::Adopted
                    }
                    Err(e) if stale => {
                        debug!(error = %e, "Stale connect attempt failed");
                        ConnectionOutcome::Discarded
                    }
                    Err(e) => {
                        if self.current.is_none() {
                            self.state = ConnectionState::Disconnected;
                        }
                        warn!(
                            error = %e,
                            attempt = ticket.attempt,
                            "Broker connect attempt failed"
                        );
                        ConnectionOutcome::Failed(e.to_string())
                    }
                }
            }
            ConnectionEvent::Dropped { ticket, reason } => {
                let is_current = self
                    .current
                    .as_ref()
                    .is_some_and(|active| active.ticket == ticket);
                if !is_current {
                    return ConnectionOutcome::Ignored;
                }

                self.current = None;
                self.state = if self.in_flight.is_some() {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Disconnected
                };
                warn!(reason = %reason, "Broker connection lost");
                ConnectionOutcome::Lost {
                    reason,
                    reconnect: self.reconnect_enabled,
                }
            }
        }
    }

    /// Forces the manager to `Disconnected`, closing the current session.
    pub async fn close(&mut self) {
        if let Some(active) = self.current.take() {
            active.session.close().await;
            info!(epoch = active.ticket.epoch, "Broker connection closed");
        }
        self.state = ConnectionState::Disconnected;
    }
}
