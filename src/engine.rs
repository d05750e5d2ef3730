//! The event loop that ties the address book, client table, registry, and stats together.
//! `Engine` owns the one `mio::Poll` the whole process uses and is the sole mutator of every
//! other piece of state: single-threaded, cooperative, driven by the caller calling
//! `run_nowait` rather than by a sans-IO core plus a separate async driver like the teacher's
//! `firezone-relay`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Token;
use socket2::{Domain, Protocol, Socket, Type};

use crate::address_book::AddressBook;
use crate::clients::ClientTable;
use crate::dns;
use crate::error::EngineError;
use crate::ingress::{self, ObjectChain};
use crate::registry::{Query, Registry, RequestId};
use crate::stats::Stats;
use crate::time_events::TimeEvents;
use crate::transport::Transport;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
const MAX_UDP_SIZE: usize = 65536;
const MAX_EVENTS: usize = 1024;

/// Result of one `run_nowait` iteration, letting an embedder decide whether to keep polling
/// tightly or back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// At least one request is in flight or a timer is armed; call again soon.
    Active,
    /// Nothing outstanding; safe to wait longer before the next call.
    Idle,
}

#[derive(Debug, Clone, Copy)]
enum CloseCause {
    Matched,
    TimedOut,
    Failed,
}

pub struct Engine {
    address_book: AddressBook,
    clients: ClientTable,
    stats: Stats,
    registry: Registry,
    timeouts: TimeEvents<RequestId>,
    poll: mio::Poll,
    events: mio::Events,
    next_token: usize,
    transport: Transport,
    timeout: Duration,
    free_after_use: bool,
}

impl Engine {
    /// Allocates the client table and the engine's `mio::Poll`.
    ///
    /// `mio::Poll::new` failing indicates OS resource exhaustion, which is fatal here: this
    /// panics rather than returning a half-usable `Engine`.
    pub fn new(max_clients: u32) -> Self {
        let poll = mio::Poll::new().expect("failed to create the event loop's mio::Poll");

        Self {
            address_book: AddressBook::new(),
            clients: ClientTable::new(max_clients),
            stats: Stats::new(),
            registry: Registry::new(),
            timeouts: TimeEvents::default(),
            poll,
            events: mio::Events::with_capacity(MAX_EVENTS),
            next_token: 0,
            transport: Transport::UdpOnly,
            timeout: DEFAULT_TIMEOUT,
            free_after_use: false,
        }
    }

    pub fn set_transport(&mut self, transport: Transport) -> Result<(), EngineError> {
        if transport != Transport::UdpOnly {
            return Err(EngineError::UnsupportedTransport(transport));
        }

        self.transport = transport;
        Ok(())
    }

    pub fn set_target(&mut self, ip: &str, port: u16) -> Result<(), EngineError> {
        self.address_book.set_target(ip, port)
    }

    pub fn bind_source(&mut self, ip: &str) -> Result<(), EngineError> {
        self.address_book.bind_source(ip)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_free_after_use(&mut self, free_after_use: bool) {
        self.free_after_use = free_after_use;
    }

    pub fn stat_collect(&mut self, interval: Duration) {
        self.stats.collect(interval, Instant::now());
    }

    pub fn stat_finish(&mut self) {
        self.stats.finish();
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    pub fn in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    /// The earliest instant at which calling `run_nowait` again could do useful work: either an
    /// armed request timeout or the next stats tick, whichever comes first. An embedder that
    /// drives its own loop (instead of spinning) can sleep until this instant instead of
    /// guessing a poll interval.
    pub fn next_wake(&self) -> Option<Instant> {
        match (self.timeouts.next_trigger(), self.stats.next_tick()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Admits one packet: demultiplexes it, resolves its client slot, and opens a query toward
    /// the configured target.
    ///
    /// `free_after_use` governs whether the request clones an independent copy of the payload
    /// (`true`, the request owns its own copy and frees it when done) or shares the ingress
    /// chain's allocation via the `Arc` refcount (`false`, zero-copy and safe even if the caller
    /// drops `chain` immediately after this call returns).
    pub fn receive(&mut self, chain: &ObjectChain) {
        let now = Instant::now();
        self.stats.record_processed();

        let Some(demuxed) = ingress::demux(chain) else {
            self.stats.record_discarded();
            return;
        };

        let Some(client_key) = self.clients.key_for(demuxed.dst) else {
            self.stats.record_discarded();
            return;
        };

        let payload: Arc<[u8]> = if self.free_after_use {
            Arc::from(demuxed.payload.as_ref())
        } else {
            demuxed.payload
        };

        let Some(id) = self.registry.create_request_udp(client_key, payload) else {
            self.stats.record_discarded();
            return;
        };

        if let Some(slot) = self.clients.get_mut(client_key) {
            slot.req_total += 1;
        }
        self.stats.record_total();

        let payload = self.registry.get(id).expect("just created").payload.clone();

        match self.start_query(&payload) {
            Ok(query) => {
                self.registry.attach_query(id, query);
                self.stats.record_query_started();

                self.registry.arm_timeout(id);
                self.timeouts.add(now + self.timeout, id);
            }
            Err(error) => {
                tracing::debug!(%id, %error, "failed to create UDP query for request");
                self.stats.record_discarded();
                self.close_and_free(id, CloseCause::Failed);
            }
        }
    }

    /// Allocates a UDP endpoint, optionally bound to the next source address, and sends the
    /// payload once. Splicing the resulting query onto the request is left to the caller, since
    /// only it knows the `RequestId`.
    fn start_query(&mut self, payload: &[u8]) -> io::Result<Query> {
        let target = self.address_book.target().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no target address configured")
        })?;

        let bind_addr = self
            .address_book
            .next_source()
            .unwrap_or_else(|| ephemeral_bind_addr(target));

        let std_socket = bind_nonblocking_udp_socket(bind_addr)?;
        let mut socket = mio::net::UdpSocket::from_std(std_socket);

        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut socket, token, mio::Interest::READABLE)?;

        // A send failure here does not fail query creation: the endpoint is still live and
        // registered, so the timeout reclaims it like any other unanswered query.
        match socket.send_to(payload, target) {
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(%error, %target, "try_send failed; leaving query live for the timeout to reclaim");
            }
        }

        Ok(Query { token, socket })
    }

    /// Drives one non-blocking iteration of the event loop: polls for readable sockets,
    /// expires due timeouts, and ticks the stats interval.
    pub fn run_nowait(&mut self) -> LoopStatus {
        let now = Instant::now();

        if let Err(error) = self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            tracing::error!(%error, "mio poll failed");
            return LoopStatus::Active;
        }

        let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for token in tokens {
            self.handle_readable(token, now);
        }

        let expired = self.timeouts.pending_actions(now);
        for id in expired {
            self.handle_timeout(id);
        }

        self.stats.tick(now);

        if self.registry.in_flight() == 0 {
            LoopStatus::Idle
        } else {
            LoopStatus::Active
        }
    }

    /// Drains datagrams from the socket identified by `token` until it would block.
    ///
    /// If `token` no longer maps to a live request (its request was already freed by a prior
    /// event this same batch), this is a no-op: there is no socket left to read from, and no
    /// request memory to dereference. A reply that arrives after its request closed is simply
    /// dropped.
    fn handle_readable(&mut self, token: Token, now: Instant) {
        let mut buf = [0u8; MAX_UDP_SIZE];

        loop {
            let Some(id) = self.registry.find_by_token(token) else {
                return;
            };

            let recv_result = {
                let Some(request) = self.registry.get_mut(id) else {
                    return;
                };
                let Some(query) = request.queries.iter_mut().find(|q| q.token == token) else {
                    return;
                };
                query.socket.recv_from(&mut buf)
            };

            match recv_result {
                Ok((n, _from)) => self.handle_reply(id, &buf[..n], now),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) => {
                    tracing::debug!(%error, %id, "error receiving on query socket");
                    return;
                }
            }
        }
    }

    /// The reply receive path: parse, match by id, count, and close on a genuine match.
    fn handle_reply(&mut self, id: RequestId, bytes: &[u8], _now: Instant) {
        let Some(request) = self.registry.get(id) else {
            return;
        };
        let expected_id = request.header.id;
        let client_key = request.client_key;

        let header = match dns::parse_header(bytes) {
            Ok(header) => header,
            Err(_) => {
                tracing::trace!(%id, "dropping malformed reply");
                return;
            }
        };

        if header.id != expected_id {
            tracing::trace!(%id, expected = expected_id, got = header.id, "dropping reply with mismatched id");
            return;
        }

        if header.tc {
            tracing::trace!(%id, "dropping truncated reply; timeout still governs closure");
            return;
        }

        self.stats.record_answered();
        if let Some(slot) = self.clients.get_mut(client_key) {
            slot.req_answered += 1;
        }

        if header.rcode == domain::base::iana::Rcode::NOERROR {
            self.stats.record_noerror();
            if let Some(slot) = self.clients.get_mut(client_key) {
                slot.req_noerror += 1;
            }
        }

        self.close_and_free(id, CloseCause::Matched);
    }

    fn handle_timeout(&mut self, id: RequestId) {
        self.close_and_free(id, CloseCause::TimedOut);
    }

    /// Stops the timeout, closes every query, then frees the request if that left it freeable.
    fn close_and_free(&mut self, id: RequestId, cause: CloseCause) {
        self.timeouts.cancel(&id);

        let queries = self.registry.close_request(id);
        for mut query in queries {
            if let Err(error) = self.poll.registry().deregister(&mut query.socket) {
                tracing::debug!(%error, %id, "failed to deregister query socket");
            }
            self.stats.record_query_ended();
        }

        if self.registry.maybe_free(id).is_some() && matches!(cause, CloseCause::TimedOut) {
            self.stats.record_timed_out();
        }
    }
}

fn ephemeral_bind_addr(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Creates a non-blocking UDP socket bound to `addr` (teacher's `make_wildcard_socket` idiom in
/// `relay/server/src/sockets.rs`, adapted to bind an arbitrary address instead of a wildcard).
fn bind_nonblocking_udp_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::PacketObject;
    use domain::base::iana::Rtype;
    use domain::base::MessageBuilder;
    use smallvec::SmallVec;
    use std::net::Ipv4Addr;
    use std::thread;

    fn dns_query_bytes(id: u16) -> Vec<u8> {
        let mut builder = MessageBuilder::new_vec().question();
        builder.header_mut().set_id(id);
        let name: domain::base::Name<Vec<u8>> = "example.com".parse().unwrap();
        builder.push((name, Rtype::A)).unwrap();
        builder.into_message().into_octets()
    }

    fn packet(dst: Ipv4Addr, payload: Vec<u8>) -> ObjectChain {
        let mut chain: ObjectChain = SmallVec::new();
        chain.push(PacketObject::Ip(dst));
        chain.push(PacketObject::Payload(Arc::from(payload)));
        chain
    }

    /// A throwaway UDP resolver used only by tests: replies to every datagram it receives
    /// according to `respond`, then exits.
    fn spawn_mock_resolver(
        respond: impl Fn(u16) -> Option<Vec<u8>> + Send + 'static,
    ) -> SocketAddr {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();

        thread::spawn(move || {
            let mut buf = [0u8; 512];
            let Ok((n, from)) = socket.recv_from(&mut buf) else {
                return;
            };
            let id = u16::from_be_bytes([buf[0], buf[1]]);
            let _ = n;
            if let Some(reply) = respond(id) {
                let _ = socket.send_to(&reply, from);
            }
        });

        addr
    }

    fn noerror_reply(id: u16) -> Vec<u8> {
        let mut builder = MessageBuilder::new_vec().question();
        builder.header_mut().set_id(id);
        builder.header_mut().set_qr(true);
        let name: domain::base::Name<Vec<u8>> = "example.com".parse().unwrap();
        builder.push((name, Rtype::A)).unwrap();
        builder.into_message().into_octets()
    }

    #[test]
    fn out_of_range_client_key_is_discarded() {
        let mut engine = Engine::new(4);
        engine.set_target("127.0.0.1", 53).unwrap();

        // First 4 bytes of 0.0.0.7 form the key 7, out of range for max_clients=4.
        let chain = packet(Ipv4Addr::new(0, 0, 0, 7), dns_query_bytes(1));
        engine.receive(&chain);

        assert_eq!(engine.stats().discarded(), 1);
        assert_eq!(engine.stats().sum().total, 0);
    }

    #[test]
    fn malformed_chain_is_discarded() {
        let mut engine = Engine::new(4);
        let mut chain: ObjectChain = SmallVec::new();
        chain.push(PacketObject::Other);
        engine.receive(&chain);

        assert_eq!(engine.stats().discarded(), 1);
    }

    #[test]
    fn scenario_matching_noerror_reply_increments_total_answered_noerror() {
        let mut engine = Engine::new(4);
        let resolver = spawn_mock_resolver(|id| Some(noerror_reply(id)));
        engine.set_target(&resolver.ip().to_string(), resolver.port()).unwrap();
        engine.set_timeout(Duration::from_millis(500));

        let chain = packet(Ipv4Addr::new(0, 0, 0, 2), dns_query_bytes(0x1234));
        engine.receive(&chain);

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.in_flight() > 0 && Instant::now() < deadline {
            engine.run_nowait();
            thread::sleep(Duration::from_millis(5));
        }

        let sum = engine.stats().sum();
        assert_eq!(sum.total, 1);
        assert_eq!(sum.answered, 1);
        assert_eq!(sum.noerror, 1);
        assert_eq!(engine.stats().ongoing(), 0);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn scenario_mismatched_id_times_out_without_marking_answered() {
        let mut engine = Engine::new(4);
        let resolver = spawn_mock_resolver(|_id| {
            let mut builder = MessageBuilder::new_vec().question();
            builder.header_mut().set_id(0x1235); // deliberately wrong id
            builder.header_mut().set_qr(true);
            let name: domain::base::Name<Vec<u8>> = "example.com".parse().unwrap();
            builder.push((name, Rtype::A)).unwrap();
            Some(builder.into_message().into_octets())
        });
        engine.set_target(&resolver.ip().to_string(), resolver.port()).unwrap();
        engine.set_timeout(Duration::from_millis(100));

        let chain = packet(Ipv4Addr::new(0, 0, 0, 2), dns_query_bytes(0x1234));
        engine.receive(&chain);

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.in_flight() > 0 && Instant::now() < deadline {
            engine.run_nowait();
            thread::sleep(Duration::from_millis(5));
        }

        let sum = engine.stats().sum();
        assert_eq!(sum.total, 1);
        assert_eq!(sum.answered, 0);
        assert_eq!(engine.stats().ongoing(), 0);
    }

    #[test]
    fn scenario_truncated_reply_does_not_answer_and_still_times_out() {
        let mut engine = Engine::new(4);
        let resolver = spawn_mock_resolver(|id| {
            let mut builder = MessageBuilder::new_vec().question();
            builder.header_mut().set_id(id);
            builder.header_mut().set_qr(true);
            builder.header_mut().set_tc(true);
            let name: domain::base::Name<Vec<u8>> = "example.com".parse().unwrap();
            builder.push((name, Rtype::A)).unwrap();
            Some(builder.into_message().into_octets())
        });
        engine.set_target(&resolver.ip().to_string(), resolver.port()).unwrap();
        engine.set_timeout(Duration::from_millis(100));

        let chain = packet(Ipv4Addr::new(0, 0, 0, 2), dns_query_bytes(0x1234));
        engine.receive(&chain);

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.in_flight() > 0 && Instant::now() < deadline {
            engine.run_nowait();
            thread::sleep(Duration::from_millis(5));
        }

        let sum = engine.stats().sum();
        assert_eq!(sum.total, 1);
        assert_eq!(sum.answered, 0);
        assert_eq!(sum.noerror, 0);
    }

    #[test]
    fn no_reply_times_out_and_frees_the_request() {
        let mut engine = Engine::new(4);
        engine.set_target("127.0.0.1", 1).unwrap(); // nothing listens here
        engine.set_timeout(Duration::from_millis(50));

        let chain = packet(Ipv4Addr::new(0, 0, 0, 2), dns_query_bytes(0x1234));
        engine.receive(&chain);
        assert_eq!(engine.in_flight(), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.in_flight() > 0 && Instant::now() < deadline {
            engine.run_nowait();
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.stats().ongoing(), 0);
        assert_eq!(engine.stats().sum().total, 1);
        assert_eq!(engine.stats().sum().answered, 0);
    }

    #[test]
    fn source_ring_rotates_once_per_query_across_requests() {
        let mut engine = Engine::new(1);
        engine.set_target("127.0.0.1", 1).unwrap();
        engine.bind_source("127.0.0.1").unwrap();
        engine.bind_source("127.0.0.1").unwrap();
        engine.bind_source("127.0.0.1").unwrap();
        engine.set_timeout(Duration::from_millis(50));

        for i in 0..3 {
            let chain = packet(Ipv4Addr::new(0, 0, 0, 0), dns_query_bytes(i));
            engine.receive(&chain);
        }

        assert_eq!(engine.address_book.source_count(), 3);
        assert_eq!(engine.in_flight(), 3);
    }
}
