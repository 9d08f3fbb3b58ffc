//! # Lobby Authority
//!
//! The authoritative side of the replication protocol. It holds the canonical
//! copy of every replicated field, validates every proposed write, and fans
//! each applied write out to all observers.
//!
//! ## Core Responsibilities
//!
//! ### Single Writer
//! Only the authority mutates replicated state. Observers send mutation
//! requests; the authority accepts or rejects them and publishes the result.
//! A rejected request is logged and dropped, never broadcast.
//!
//! ### Contested State
//! Exclusive slots (class selection, build-grid cells) go to whichever claim
//! the authority received first. Switching slots releases the old one before
//! claiming the new one, in a single authoritative step.
//!
//! ### Timed State
//! The ready-check countdown and build timers are driven from the authority
//! tick. The countdown fires exactly once per arm, and its terminal step
//! moves the lobby into the game.
//!
//! ## Module Organization
//!
//! - `store`: canonical field values and the change feed
//! - `router`: per-family validation of mutation requests
//! - `broadcaster`: fan-out of changes to every registered observer
//! - `countdown`: the `Idle → Running → Fired` timer state machine
//! - `lobby`: roster, game phase and the delayed player spawn
//! - `projectiles`: projectile spawn authority and hit damage
//! - `session`: the composed authority the host loop drives
//! - `client_manager`: connections and receipt-ordered request queues
//! - `network`: the UDP host loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default().with_tick_rate(60);
//!     let mut server = Server::new(config).await?;
//!
//!     // Receives requests, ticks the session, and sends every change
//!     // notification to the observers it concerns
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod client_manager;
pub mod config;
pub mod countdown;
pub mod error;
pub mod lobby;
pub mod network;
pub mod projectiles;
pub mod router;
pub mod session;
pub mod store;

pub use error::{RejectReason, RouteResult};
pub use session::{AuthoritySession, SessionEvent};
