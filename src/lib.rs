//! DNS traffic replay sink: a single-threaded, non-blocking engine that takes decoded packet
//! objects, issues UDP queries toward a configured target resolver, matches replies back to
//! their originating request by DNS message id, and keeps per-client and aggregate statistics.
//!
//! See `DESIGN.md` for how each module is grounded in the reference material this crate was
//! built from.

mod address_book;
mod clients;
mod dns;
mod engine;
mod error;
mod ingress;
mod registry;
mod stats;
mod time_events;
mod transport;

pub use clients::{ClientSlot, ClientTable};
pub use engine::{Engine, LoopStatus};
pub use error::EngineError;
pub use ingress::{ObjectChain, PacketObject};
pub use stats::{Counters, Snapshot, Stats};
pub use transport::Transport;
