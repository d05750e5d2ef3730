use std::net::IpAddr;

/// Per-client accounting slot, indexed densely by `ClientTable`.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ClientSlot {
    pub req_total: u64,
    pub req_answered: u64,
    pub req_noerror: u64,
    pub latency_sum_ms: f64,
    pub latency_sum_sq_ms: f64,
    pub latency_count: f64,
}

/// Fixed-size table of per-client counters, indexed by a key derived from the destination IP
/// of the inbound packet.
///
/// `max_clients` is fixed at construction; there is no resize and no eviction.
#[derive(Debug)]
pub struct ClientTable {
    slots: Vec<ClientSlot>,
}

impl ClientTable {
    /// Allocates `max_clients` slots, every one of them default-initialized.
    pub fn new(max_clients: u32) -> Self {
        Self {
            slots: vec![ClientSlot::default(); max_clients as usize],
        }
    }

    pub fn max_clients(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Derives the client key from the first 4 bytes of `dst`, returning `None` if the key
    /// would fall outside `[0, max_clients)`.
    pub fn key_for(&self, dst: IpAddr) -> Option<u32> {
        let key = match dst {
            IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]])
            }
        };

        (key < self.max_clients()).then_some(key)
    }

    pub fn get(&self, key: u32) -> Option<&ClientSlot> {
        self.slots.get(key as usize)
    }

    pub fn get_mut(&mut self, key: u32) -> Option<&mut ClientSlot> {
        self.slots.get_mut(key as usize)
    }
}
