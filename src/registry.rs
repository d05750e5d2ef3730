//! The request registry.
//!
//! `RequestId` is a monotonically increasing `u64` that is never reused once issued. That
//! single choice replaces raw back-pointers from a handle to its owning request: once a
//! `Request` is removed from `Registry::requests`, no later mio or timer event can resolve its
//! id back to live state, because the id simply isn't in the map anymore. There is no window in
//! which a callback can dereference freed request memory.
//!
//! Timer scheduling itself lives in `Engine` (backed by `crate::time_events::TimeEvents`); this
//! module only tracks whether a request's timeout is currently armed, which is all that
//! `is_freeable` needs to know.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use mio::Token;

use crate::dns::{self, DnsHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// One protocol-level send attempt bound to one ephemeral endpoint.
pub struct Query {
    pub token: Token,
    pub socket: mio::net::UdpSocket,
}

/// One logical DNS lookup.
pub struct Request {
    pub client_key: u32,
    pub payload: Arc<[u8]>,
    pub header: DnsHeader,
    pub queries: Vec<Query>,
    pub timeout_armed: bool,
}

impl Request {
    /// A request is freeable once it owns no queries and has no armed timeout.
    pub fn is_freeable(&self) -> bool {
        self.queries.is_empty() && !self.timeout_armed
    }
}

#[derive(Default)]
pub struct Registry {
    requests: HashMap<RequestId, Request>,
    /// Reverse index from a query's mio token to its owning request, kept in sync by
    /// `attach_query` and `close_request` so `find_by_token` never has to scan.
    by_token: HashMap<Token, RequestId>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Parses the payload's DNS header and, if it is well-formed, creates a request with no
    /// queries and no armed timeout yet.
    ///
    /// A malformed header is a per-request soft failure: the caller increments `discarded` and
    /// nothing is created. This folds "allocate, then tear down immediately on a bad header"
    /// into a single fallible call, since no observer can ever see the half-built request in
    /// between.
    pub fn create_request_udp(&mut self, client_key: u32, payload: Arc<[u8]>) -> Option<RequestId> {
        let header = dns::parse_header(&payload).ok()?;

        let id = self.next_id();
        self.requests.insert(
            id,
            Request {
                client_key,
                payload,
                header,
                queries: Vec::new(),
                timeout_armed: false,
            },
        );

        Some(id)
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(&id)
    }

    pub fn attach_query(&mut self, id: RequestId, query: Query) {
        if let Some(request) = self.requests.get_mut(&id) {
            self.by_token.insert(query.token, id);
            request.queries.push(query);
        }
    }

    pub fn arm_timeout(&mut self, id: RequestId) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.timeout_armed = true;
        }
    }

    pub fn find_by_token(&self, token: Token) -> Option<RequestId> {
        self.by_token.get(&token).copied()
    }

    /// Closes every query belonging to `id` by disarming the timeout and handing the owned
    /// sockets back to the caller for de-registration from `mio::Poll`.
    ///
    /// Stops the timeout, then closes each query. Closing a `mio::net::UdpSocket` is a
    /// synchronous, immediate operation here, so the request is immediately eligible for
    /// `maybe_free` once this returns.
    pub fn close_request(&mut self, id: RequestId) -> Vec<Query> {
        let Some(request) = self.requests.get_mut(&id) else {
            return Vec::new();
        };

        request.timeout_armed = false;
        let queries = std::mem::take(&mut request.queries);
        for query in &queries {
            self.by_token.remove(&query.token);
        }

        queries
    }

    /// Frees the request iff it has no queries and no armed timeout.
    pub fn maybe_free(&mut self, id: RequestId) -> Option<Request> {
        let freeable = self.requests.get(&id).is_some_and(Request::is_freeable);

        if freeable {
            self.requests.remove(&id)
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }
}
