//! RelayCast - cross-pod real-time messaging gateway
//!
//! Authenticated clients hold a long-lived WebSocket to any pod; RelayCast
//! routes chat, call signaling and file notifications between clients no
//! matter which pod each one is attached to, and stores what it cannot
//! deliver for later pickup.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → gateway → dispatcher → call engine ─┐
//!                                   └→ router ──────┼→ local socket
//!                                                   ├→ relay bus (other pod)
//!                                                   └→ undelivered store + notify bus
//! ```
//!
//! Presence (`presence:{userId}` → pod) decides between the relay and the
//! offline flow. Backend traits ship with a Redis production implementation
//! and an in-memory one for single-node runs and tests.

pub mod auth;
pub mod calls;
pub mod config;
pub mod dispatch;
pub mod files;
pub mod gateway;
pub mod http;
pub mod message;
pub mod notify;
pub mod presence;
pub mod profile;
pub mod registry;
pub mod relay;
pub mod router;
pub mod store;

pub use auth::TokenVerifier;
pub use calls::{CallEngine, CallSession, CallState};
pub use config::{Config, ConfigError};
pub use dispatch::InboundDispatcher;
pub use files::{FileBatch, FileNotifier, NotifyOutcome};
pub use http::AppState;
pub use message::{CallSignal, ChatRequest, MessageEnvelope, RelayPayload, SignalFrame};
pub use notify::{
    MemoryNotificationBus, NotificationBus, NotificationChannel, NotificationEvent,
    NotificationPublisher, RedisStreamBus,
};
pub use presence::{MemoryPresence, PresenceDirectory, RedisPresence};
pub use profile::{HttpProfileLoader, Profile, ProfileCache, ProfileLoader};
pub use registry::{SessionHandle, SessionRegistry};
pub use relay::{MemoryRelay, RedisRelay, RelayBus, RelayCallback};
pub use router::{DeliveryRouter, OutboundSink, RouteOutcome, SinkOutcome};
pub use store::{MemoryUndeliveredStore, RedisUndeliveredStore, UndeliveredStore};
