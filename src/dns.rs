//! Thin wrapper over the `domain` crate, extracting only the header fields the matcher and
//! registry consume. Leans on the same `domain::base::Message::from_octets` entry point the
//! teacher's `dns-types` crate uses for its own `Query::parse`.

use domain::base::iana::Rcode;
use domain::base::Message;

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("message too short or otherwise malformed")]
    Malformed,
}

/// The subset of a DNS header this engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,
    pub tc: bool,
    pub rcode: Rcode,
}

/// Parses just enough of `bytes` to recover the header fields used for matching and
/// accounting. Used both for the outgoing request payload (to learn the id to match replies
/// against) and for incoming replies.
pub fn parse_header(bytes: &[u8]) -> Result<DnsHeader, DnsError> {
    let message = Message::from_octets(bytes).map_err(|_| DnsError::Malformed)?;
    let header = message.header();

    Ok(DnsHeader {
        id: header.id(),
        qr: header.qr(),
        tc: header.tc(),
        rcode: header.rcode(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::iana::Rtype;
    use domain::base::{MessageBuilder, Name};

    fn build_query(id: u16) -> Vec<u8> {
        let mut builder = MessageBuilder::new_vec().question();
        builder.header_mut().set_id(id);
        builder.header_mut().set_rd(true);
        let name: Name<Vec<u8>> = "example.com".parse().unwrap();
        builder.push((name, Rtype::A)).unwrap();
        builder.into_message().into_octets()
    }

    #[test]
    fn parses_id_from_a_well_formed_query() {
        let bytes = build_query(0x1234);
        let header = parse_header(&bytes).unwrap();

        assert_eq!(header.id, 0x1234);
        assert!(!header.qr);
    }

    #[test]
    fn rejects_truncated_bytes() {
        let bytes = [0u8; 2];
        assert!(parse_header(&bytes).is_err());
    }
}
