use std::net::AddrParseError;

use thiserror::Error;

/// Configuration-fatal errors: raised loudly, non-recoverable for the call that triggered them.
///
/// Per-request and per-response soft failures are *not* represented here; they never leave
/// the engine as a `Result`, they only show up as counter movement (see `crate::stats`).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to parse target address `{input}`: {source}")]
    InvalidTarget {
        input: String,
        #[source]
        source: AddrParseError,
    },

    #[error("failed to parse source address `{input}`: {source}")]
    InvalidSource {
        input: String,
        #[source]
        source: AddrParseError,
    },

    #[error("transport {0:?} is not supported; only Transport::UdpOnly is implemented")]
    UnsupportedTransport(crate::transport::Transport),
}
