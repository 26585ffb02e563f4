//! # Bot core
//!
//! The pieces that turn radio events into replies:
//!
//! - [`supervisor`] keeps one radio link alive and tells everyone else whether it is usable
//! - [`dispatch`] classifies inbound packets and decides what to answer
//! - [`rate_limit`] gates trigger replies per sender
//! - [`delivery`] splits and sends replies in the background
//! - [`traceroute`] queues, paces and correlates path traces
//! - [`server`] wires them together and owns the event loop
//!
//! ```text
//!  radio ──events──▶ BotServer ──▶ InboundDispatcher ─┬─▶ RateLimiter ─▶ DeliveryPipeline ─▶ radio
//!                                                     └─▶ TracerouteOrchestrator ──(paced)──▶ radio
//! ```
pub mod delivery;
pub mod dispatch;
pub mod rate_limit;
pub mod replies;
pub mod server;
pub mod supervisor;
pub mod traceroute;

pub use delivery::{split_message, DeliveryPipeline};
pub use dispatch::{Disposition, InboundDispatcher};
pub use rate_limit::RateLimiter;
pub use server::BotServer;
pub use supervisor::{ConnectionSupervisor, LinkState, SupervisorSettings};
pub use traceroute::{Admission, TraceSettings, TracerouteOrchestrator};
