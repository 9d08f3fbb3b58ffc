//! Connected-participant bookkeeping and request queuing for the authority
//!
//! This module tracks the remote side of every participant:
//! - Connection lifecycle (connect, disconnect, timeout)
//! - Buffered mutation requests awaiting the next authority tick
//! - Receipt ordering, so contested slots go to whoever arrived first
//! - Capacity limits and address lookup for outgoing datagrams
//!
//! The session decides what a request does; this module only decides the
//! order requests reach it.

use log::info;
use shared::{MutationRequest, ParticipantId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A request together with the order the authority received it in
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request: MutationRequest,
    /// Monotonic receipt stamp, shared across all clients
    pub received: u64,
}

/// A connected participant and their buffered requests
#[derive(Debug)]
pub struct Client {
    /// Identity assigned by the authority for this connection
    pub id: ParticipantId,
    /// Where to send datagrams for this participant
    pub addr: SocketAddr,
    /// Last time any packet arrived from this participant
    pub last_seen: Instant,
    /// Highest request sequence handed to the session
    pub last_processed_sequence: u32,
    /// Requests waiting for the next tick
    pub pending_requests: Vec<QueuedRequest>,
}

impl Client {
    pub fn new(id: ParticipantId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            last_processed_sequence: 0,
            pending_requests: Vec::new(),
        }
    }

    /// Refreshes the activity stamp without queuing anything
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Buffers a request in sequence order
    ///
    /// Datagrams can arrive out of order, so the buffer is kept sorted by
    /// the requester's own sequence numbers.
    pub fn add_request(&mut self, request: MutationRequest, received: u64) {
        self.touch();
        self.pending_requests.push(QueuedRequest { request, received });
        self.pending_requests.sort_by_key(|q| q.request.sequence);
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Tracks every connected participant and orders their requests
///
/// Requests from different participants are interleaved by receipt order.
/// Requests from one participant always keep their send order, even when
/// their datagrams arrived swapped.
pub struct ClientManager {
    clients: HashMap<ParticipantId, Client>,
    /// Next identity to hand out; 0 is the authority's own
    next_client_id: u32,
    max_clients: usize,
    timeout: Duration,
    receipt_counter: u64,
}

impl ClientManager {
    /// Creates an empty manager; identities start at 1
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
            receipt_counter: 0,
        }
    }

    /// Admits a new participant, or returns None at capacity
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<ParticipantId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = ParticipantId(self.next_client_id);
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));
        Some(client_id)
    }

    /// Removes a participant, dropping anything still buffered for them
    pub fn remove_client(&mut self, client_id: &ParticipantId) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ParticipantId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn touch(&mut self, client_id: ParticipantId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    /// Buffers a request, stamping it with its receipt order
    ///
    /// The requester field is overwritten with the connection's identity,
    /// so a client cannot speak for anyone else. Requests at or below the
    /// last processed sequence are duplicates and are dropped.
    pub fn add_request(&mut self, client_id: ParticipantId, mut request: MutationRequest) -> bool {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return false;
        };
        if request.sequence <= client.last_processed_sequence {
            client.touch();
            return false;
        }
        request.requester = client_id;
        self.receipt_counter += 1;
        client.add_request(request, self.receipt_counter);
        true
    }

    /// Every unprocessed request, in the order the session should apply them
    ///
    /// Each participant's receipt stamps are handed back out in sequence
    /// order, then all requests are merged by stamp. A participant whose
    /// sequence 2 overtook sequence 1 on the wire still has 1 applied first,
    /// in the slot where the earlier datagram arrived.
    pub fn get_chronological_requests(&self) -> Vec<(ParticipantId, MutationRequest)> {
        let mut ordered: Vec<(u64, ParticipantId, MutationRequest)> = Vec::new();

        for (client_id, client) in &self.clients {
            let pending: Vec<&QueuedRequest> = client
                .pending_requests
                .iter()
                .filter(|q| q.request.sequence > client.last_processed_sequence)
                .collect();

            let mut stamps: Vec<u64> = pending.iter().map(|q| q.received).collect();
            stamps.sort_unstable();

            for (queued, stamp) in pending.into_iter().zip(stamps) {
                ordered.push((stamp, *client_id, queued.request.clone()));
            }
        }

        ordered.sort_by_key(|(stamp, _, _)| *stamp);
        ordered
            .into_iter()
            .map(|(_, client_id, request)| (client_id, request))
            .collect()
    }

    pub fn mark_request_processed(&mut self, client_id: ParticipantId, sequence: u32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_processed_sequence = client.last_processed_sequence.max(sequence);
        }
    }

    /// Drops buffered requests the session has already seen
    pub fn cleanup_processed_requests(&mut self) {
        for client in self.clients.values_mut() {
            let last = client.last_processed_sequence;
            client
                .pending_requests
                .retain(|q| q.request.sequence > last);
        }
    }

    /// Removes participants that went quiet and returns who they were
    pub fn check_timeouts(&mut self) -> Vec<ParticipantId> {
        let timed_out: Vec<ParticipantId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(self.timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    pub fn get_client_addr(&self, client_id: ParticipantId) -> Option<SocketAddr> {
        self.clients.get(&client_id).map(|client| client.addr)
    }

    pub fn get_client_addrs(&self) -> Vec<(ParticipantId, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
