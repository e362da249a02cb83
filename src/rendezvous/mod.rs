//! The rendezvous server: introduces peers on the same network to each other, relays their
//!  signaling (and relayed frames), and evicts clients that stop answering heartbeats.

pub mod identity;
pub mod rooms;
mod server;

pub use server::{Handshake, RendezvousServer};
