use std::net::{IpAddr, SocketAddr};

use crate::error::EngineError;

/// The target resolver plus a rotating ring of local addresses to bind queries from.
///
/// Mirrors the teacher's `AddressBook`-shaped state in `firezone-relay` (a single public
/// address plus per-allocation bookkeeping), simplified here to a single target and a plain
/// `Vec` + cursor instead of an ad hoc circular list.
#[derive(Debug, Default)]
pub struct AddressBook {
    target: Option<SocketAddr>,
    sources: Vec<SocketAddr>,
    cursor: usize,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and stores the target address. Accepts both IPv4 and IPv6 literals.
    ///
    /// On failure, no state is modified.
    pub fn set_target(&mut self, ip: &str, port: u16) -> Result<(), EngineError> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|source| EngineError::InvalidTarget {
                input: ip.to_string(),
                source,
            })?;

        self.target = Some(SocketAddr::new(addr, port));
        Ok(())
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    /// Parses `ip` and appends it to the source ring.
    ///
    /// Repeated calls rotate in insertion order: the ring is just a `Vec`, so a freshly bound
    /// source is consumed only after every previously bound source has had its turn.
    pub fn bind_source(&mut self, ip: &str) -> Result<(), EngineError> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|source| EngineError::InvalidSource {
                input: ip.to_string(),
                source,
            })?;

        self.sources.push(SocketAddr::new(addr, 0));
        Ok(())
    }

    /// Returns the current source and advances the cursor, or `None` if no source is bound.
    ///
    /// A single-element ring rotates to itself; an empty ring is a no-op that lets the caller
    /// fall back to an ephemeral, unbound socket.
    pub fn next_source(&mut self) -> Option<SocketAddr> {
        if self.sources.is_empty() {
            return None;
        }

        let addr = self.sources[self.cursor];
        self.cursor = (self.cursor + 1) % self.sources.len();
        Some(addr)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}
