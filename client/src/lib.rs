//! # Lobby Observer
//!
//! The participant side of the replication protocol. An observer never
//! writes replicated state directly: it proposes mutations to the authority
//! and mirrors whatever the authority publishes back.
//!
//! ## Prediction
//! Local actions (claiming a class, readying up) write a provisional value
//! into the replica right away. The authority's notification for the same
//! field always replaces it, so a lost race simply snaps back.
//!
//! ## Module Organization
//!
//! - `replica`: confirmed and predicted field values, change handlers, tile mirror
//! - `lobby`: class selection and ready-up with their predictions
//! - `actions`: the shooter's attack loop and the builder's build timer
//! - `network`: the headless UDP participant driving all of the above
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientOptions};
//! use shared::PlayerClass;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ClientOptions {
//!         desired_class: Some(PlayerClass::Builder),
//!         auto_ready: true,
//!         ..ClientOptions::default()
//!     };
//!     let mut client = Client::new("127.0.0.1:8080", options).await?;
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod lobby;
pub mod network;
pub mod replica;
