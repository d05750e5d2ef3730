//! The ingress dispatcher: turns a chain of decoded protocol objects into the pair of fields
//! the engine needs to admit a packet.
//!
//! The chain is a `SmallVec` (the teacher's `relay` crate already depends on `smallvec` for
//! small, bounded collections), walked once for the first `Payload` element and once for the
//! first `Ip`/`Ip6` element.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use smallvec::SmallVec;

/// One element of the inbound object chain produced by the (out-of-scope) upstream decoder.
#[derive(Debug, Clone)]
pub enum PacketObject {
    Ip(Ipv4Addr),
    Ip6(Ipv6Addr),
    Payload(Arc<[u8]>),
    /// A pre-parsed DNS object or any other element the dispatcher tolerates and walks past.
    Other,
}

pub type ObjectChain = SmallVec<[PacketObject; 4]>;

/// The pair of elements the dispatcher requires to admit a packet.
pub(crate) struct Demuxed {
    pub dst: IpAddr,
    pub payload: Arc<[u8]>,
}

/// Walks `chain` to find the first `Payload` and the first `Ip`/`Ip6` element.
///
/// Returns `None` if either is missing. The caller increments `discarded` on a `None`.
pub(crate) fn demux(chain: &ObjectChain) -> Option<Demuxed> {
    let payload = chain.iter().find_map(|obj| match obj {
        PacketObject::Payload(bytes) => Some(bytes.clone()),
        _ => None,
    })?;

    let dst = chain.iter().find_map(|obj| match obj {
        PacketObject::Ip(v4) => Some(IpAddr::V4(*v4)),
        PacketObject::Ip6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    })?;

    Some(Demuxed { dst, payload })
}
