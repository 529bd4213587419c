//! Connection state machine.
//!
//! ```text
//!                 ConnectRequested           SessionOpened
//! Disconnected ───────────────────► Connecting ─────────────► Connected
//!      ▲  ▲                            │  ▲                      │   │
//!      │  └────────── OpenFailed ──────┘  │ ConnectRequested     │   │
//!      │                                  │                      │   │ ConnectionLost
//!      │                              Reconnecting ◄─────────────┘   │
//!      │      DisconnectRequested          │                          │
//!      └───────────────────────────────────┴──────────────────────────┘
//! ```
//!
//! `next` is total: every (state, event) pair yields a state, pairs without
//! an arrow above leave the state unchanged.

use std::fmt;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    SessionOpened,
    OpenFailed,
    ConnectionLost,
    DisconnectRequested,
}

impl ConnectionEvent {
    pub const ALL: [ConnectionEvent; 5] = [
        ConnectionEvent::ConnectRequested,
        ConnectionEvent::SessionOpened,
        ConnectionEvent::OpenFailed,
        ConnectionEvent::ConnectionLost,
        ConnectionEvent::DisconnectRequested,
    ];
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 4] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
    ];

    pub fn next(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (Disconnected, ConnectRequested) => Connecting,
            (Reconnecting, ConnectRequested) => Connecting,
            (Connecting, SessionOpened) => Connected,
            (Connecting, OpenFailed) => Disconnected,
            (Connected, ConnectionLost) => Reconnecting,
            (Connecting | Connected | Reconnecting, DisconnectRequested) => Disconnected,
            (state, _) => state,
        }
    }

    /// Connect is a no-op in these states
    pub fn is_active(self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }

    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
        };
        write!(f, "{}", name)
    }
}
