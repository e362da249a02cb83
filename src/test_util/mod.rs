//! This module contains utilities that are useful for testing code based on peer sessions and
//!  transports. They are used for testing this crate itself, but they are also exported for
//!  application testing.
//!
//! The tracking doubles record everything that is sent through them, so tests can assert on the
//!  exact sequence of frames or messages.

pub mod event;
pub mod peer;
pub mod registry;
pub mod transport;
