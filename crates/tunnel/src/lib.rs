//! # httptunnel
//!
//! Carries TCP connections across networks that only allow outbound HTTP.
//! A client accepts local connections and maps each one to a session on a
//! remote relay; the relay owns the real socket to the target and exposes it
//! through plain HTTP requests.
//!
//! ## Key Components
//!
//! ### Relay (server side)
//! - [`SessionTable`] - Session id to target socket mapping
//! - [`SocketGate`] - Readiness-bounded reads and writes on session sockets
//! - [`RelayServer`] - HTTP front end speaking the session protocol
//!
//! ### Client side
//! - [`SessionHandle`] - One HTTP channel to a relay session
//! - [`RelayClient`] - Accept loop with per-connection uplink/downlink workers
//!
//! ## Example
//!
//! ```rust,ignore
//! use httptunnel::{ClientSettings, Config, RelayClient};
//!
//! let config = Config::load_or_default();
//! let settings = ClientSettings::from_config(&config, "localhost:7000".parse()?)?;
//! let client = RelayClient::new(settings);
//! client.run(config.client.listen_port).await?;
//! ```

pub mod addr;
pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod protocol;
pub mod server;
pub mod table;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{ClientConfig, Config, ServerConfig, TimingConfig};

// ============================================================================
// Protocol
// ============================================================================

pub use addr::Address;
pub use error::{ProtocolError, TableError};
pub use protocol::{OpenOutcome, ReadOutcome, SessionId, WriteOutcome, BUFFER_SIZE};

// ============================================================================
// Relay
// ============================================================================

pub use gate::SocketGate;
pub use server::RelayServer;
pub use table::{Session, SessionTable, TableStats};

// ============================================================================
// Client
// ============================================================================

pub use client::{ClientSettings, RelayClient, SessionHandle};
