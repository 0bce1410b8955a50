//! # circuit-sidecar
//!
//! A sidecar that keeps a live, enriched view of the circuits an
//! anonymity-network daemon has built, and rebuilds them on demand.
//!
//! # Overview
//!
//! The sidecar talks to the daemon's line-oriented control port and
//! maintains three things:
//!
//! - **A persistent control channel** ([`control`]): one authenticated
//!   connection carrying pipelined commands with strict FIFO reply matching
//! - **A circuit snapshot** ([`pipeline`]): established generic circuits,
//!   oldest first, every hop tagged with role, nickname, address and country
//! - **Rebuilds** ([`orchestrator`]): serialized engine restarts with a
//!   one-slot debounce and a jittered rotation timer
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`api`] | [`CircuitManager`] context object and [`run_main`] |
//! | [`config`] | Configuration management (TOML, CLI, environment) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`parser`] | Reply framing, data blocks, circuit-status lines |
//! | [`control`] | Pipelined control channel and one-off exchanges |
//! | [`circuit`] | Canonical circuit records and raw input variants |
//! | [`country`] | TTL country cache, lookups, sweep, persistence |
//! | [`geo`] | Country display names |
//! | [`relays`] | Relay directory and index |
//! | [`engine`] | Circuit engine collaborator and targets |
//! | [`pipeline`] | Periodic circuit cache cycle |
//! | [`orchestrator`] | Rebuild state machine and rotation |
//! | [`logger`] | Logging infrastructure using tracing |
//!
//! # What This Library Does NOT Do
//!
//! - **Serve HTTP**: accessors on [`CircuitManager`] are meant to sit behind
//!   whatever transport the embedding process uses
//! - **Build circuits itself**: construction belongs to the engine
//!   collaborator; the stock [`engine::ControlPortEngine`] only observes
//! - **Launch the daemon**: the control port must already be listening
//!
//! # Quick Start
//!
//! ## As a Library
//!
//! ```rust,no_run
//! use circuit_sidecar::{CircuitManager, Config, SortOrder};
//!
//! #[tokio::main]
//! async fn main() -> circuit_sidecar::Result<()> {
//!     let manager = CircuitManager::new(Config::default())?;
//!     manager.start().await?;
//!     println!("{} circuits", manager.circuits(SortOrder::Desc).len());
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Run with default settings
//! circuit-sidecar
//!
//! # Connect to a specific control port with a 2-hop default
//! circuit-sidecar --control-ip 127.0.0.1 --control-port 9051 --hop-count 2
//!
//! # Generate default configuration file
//! circuit-sidecar --generate_config sidecar.toml
//! ```
//!
//! # Configuration
//!
//! ```text
//! ┌─────────────────┐
//! │ CLI / MGR_* env │ ◄── Highest priority
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Config File   │ ◄── TOML ([cache], [rotation] sections)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Defaults     │
//! └─────────────────┘
//! ```
//!
//! See [`Config`] for all available options.
//!
//! # Security Considerations
//!
//! - **Credential handling**: the cookie is held in a zeroize-on-drop
//!   wrapper and never logged
//! - **File Permissions**: the country cache is written with mode 0600
//! - **Protocol deviations**: unsolicited replies tear the session down
//!   rather than being matched to the wrong caller

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod api;
pub mod circuit;
pub mod config;
pub mod control;
pub mod country;
pub mod engine;
pub mod error;
pub mod geo;
pub mod logger;
pub mod orchestrator;
pub mod parser;
pub mod pipeline;
pub mod relays;

pub use api::{
    run_main, CircuitManager, CountryProbe, ExitChange, ExitCountry, SidecarStatus, VERSION,
};
pub use circuit::{CircuitRecord, CircuitState, Hop, HopRole, RawCircuit};
pub use config::{CacheConfig, CliArgs, Config, LogLevel, RotationSettings};
pub use control::{ControlChannel, ControlEndpoint, SecureCookie};
pub use country::{CountryCache, CountryLookup, Resolution};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, RebuildOutcome, RotationConfig};
pub use parser::ReplyBlock;
pub use pipeline::{CircuitCache, CircuitSnapshot, CycleReport, SortOrder};
