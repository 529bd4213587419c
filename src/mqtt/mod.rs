//! # MQTT Module
//!
//! Owns the single broker session photolink publishes through. Photos and
//! status text go out under a per-run topic namespace; the session is opened,
//! watched and reopened by one connection manager task.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Broker and reconnect settings
//! ├── topics.rs        - Per-session topic namespace and client ids
//! ├── message.rs       - PublishRequest and QoS levels
//! ├── state.rs         - ConnectionState transition table
//! ├── transport.rs     - Transport seam and the rumqttc adapter
//! └── mqtt_handler.rs  - Connection manager task and its handle
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! CapturePipeline ──publish──► ConnectionHandle ──► ConnectionManager ──► MqttSession ──► broker
//!                                    ▲                      │
//!                                    └──── watch state ─────┘
//! ```
//!
//! ## Integration
//!
//! - **Capture pipeline**: reads the connection state before a run and
//!   publishes info, warning and photo messages through the handle
//! - **UI**: renders the watched [`state::ConnectionState`]
//! - **Status line**: the manager reports connects, losses and give-ups
//!   through the shared `StatusReporter`

pub mod config;
pub mod message;
pub mod mqtt_handler;
pub mod state;
pub mod topics;
pub mod transport;
