/// The transport a query is carried over.
///
/// Numeric values are fixed to preserve compatibility with downstream consumers reading the
/// enum. Only `UdpOnly` is implemented; the others are declared extension points for transports
/// this engine doesn't yet speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Transport {
    UdpOnly = 255,
    Udp = 254,
    Tcp = 253,
    Tls = 252,
}
