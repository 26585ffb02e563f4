//! # meshping - ping and traceroute bot for Meshtastic networks
//!
//! meshping sits on a Meshtastic radio (TCP or USB serial) and answers simple connectivity
//! checks from anyone on the mesh:
//!
//! - **Pong replies**: `ping`, `hello` or `test` earn a reply carrying the RSSI, SNR and hop
//!   count the bot observed for the request. `ping N` asks for several.
//! - **Traceroutes**: `traceroute` queues a path trace back to the sender. Traces are paced
//!   network wide and capped per requester so the mesh is not flooded.
//! - **Peer directory**: every node the radio hears is remembered in a JSON file so replies
//!   and logs can use friendly names.
//! - **Self healing link**: the radio connection is health checked and re-established with
//!   backoff when it drops.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshping::bot::BotServer;
//! use meshping::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut server = BotServer::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bot`] - supervisor, dispatcher, delivery, traceroute orchestration and the server loop
//! - [`meshtastic`] - radio transport, stream framing and the protobuf subset
//! - [`storage`] - persistent peer directory
//! - [`config`] - configuration loading, env overrides and validation
//! - [`notify`] - operator notification sinks (log, webhook)
//! - [`metrics`] - process wide counters
//! - [`logutil`] - helpers for keeping user content log and mesh safe

pub mod bot;
pub mod config;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod notify;
pub mod storage;
