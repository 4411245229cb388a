use coap_lite::{MessageType, Packet};
use log::{debug, trace};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;

/// Progress of one inbound request exchange.
#[derive(Debug)]
enum InboundPhase {
    /// Request seen, response not yet produced. `confirmed` flips once the
    /// empty-ACK timer has fired.
    AwaitingResponse { confirmed: bool },
    /// The outgoing handler owns the response slot and is finalizing the
    /// packet. Duplicates arriving now are dropped silently.
    Claimed,
    /// Response finalized and cached for duplicate replay.
    Responded { response: Packet },
}

/// Reliability state for one inbound exchange, keyed by
/// `(remote endpoint, message ID)`.
pub struct Exchange {
    remote: SocketAddr,
    message_id: u16,
    token: Vec<u8>,
    kind: MessageType,
    serial: u64,
    phase: Mutex<InboundPhase>,
}

impl Exchange {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn is_confirmable(&self) -> bool {
        self.kind == MessageType::Confirmable
    }

    /// The response sent for this exchange, if one was produced already.
    pub fn cached_response(&self) -> Option<Packet> {
        match &*self.phase.lock().unwrap() {
            InboundPhase::Responded { response } => Some(response.clone()),
            _ => None,
        }
    }

    /// Records that an empty ACK is going out. Returns false if a response
    /// claimed the exchange first (or the ACK was already sent), in which
    /// case the caller must not emit anything.
    fn mark_confirmed(&self) -> bool {
        let mut phase = self.phase.lock().unwrap();
        match *phase {
            InboundPhase::AwaitingResponse { confirmed: false } => {
                *phase = InboundPhase::AwaitingResponse { confirmed: true };
                true
            }
            _ => false,
        }
    }

    /// Claims the response slot. Returns the confirmation state observed at
    /// the moment of the claim, or None if a response was already attached.
    fn claim(&self) -> Option<bool> {
        let mut phase = self.phase.lock().unwrap();
        match *phase {
            InboundPhase::AwaitingResponse { confirmed } => {
                *phase = InboundPhase::Claimed;
                Some(confirmed)
            }
            _ => None,
        }
    }

    fn store_response(&self, response: Packet) {
        let mut phase = self.phase.lock().unwrap();
        *phase = InboundPhase::Responded { response };
    }
}

/// How a response must be transmitted, decided against the state of its
/// originating exchange.
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseMode {
    /// The request is unconfirmed: respond inside the ACK, request mid.
    Piggybacked,
    /// An empty ACK already went out: respond as a fresh confirmable.
    Separate,
    /// The request was non-confirmable: respond as a fresh NON.
    NonConfirmable,
    /// No live exchange (evicted or never recorded): fresh NON.
    Unmatched,
    /// A response is already attached; nothing further may be sent.
    AlreadyResponded,
}

pub enum InsertOutcome {
    Inserted(Arc<Exchange>),
    Duplicate(Arc<Exchange>),
}

/// The concurrent store both reliability handlers consult.
///
/// Primary index: `(endpoint, message ID)` for deduplication, empty-ACK
/// coordination and response caching. Secondary index: `(endpoint, token)`
/// waiters, matching separate and non-confirmable responses back to the
/// request that originated them. Every inserted entry schedules its own
/// eviction timer; a serial per entry keeps a stale timer from evicting a
/// newer entry under a reused key.
pub struct ExchangeRegistry {
    lifetime: Duration,
    inbound: Mutex<InboundIndex>,
    waiters: Mutex<HashMap<(SocketAddr, Vec<u8>), oneshot::Sender<Packet>>>,
    this: Weak<ExchangeRegistry>,
}

struct InboundIndex {
    by_mid: HashMap<(SocketAddr, u16), Arc<Exchange>>,
    next_serial: u64,
}

impl ExchangeRegistry {
    pub fn new(lifetime: Duration) -> Arc<ExchangeRegistry> {
        Arc::new_cyclic(|this| ExchangeRegistry {
            lifetime,
            inbound: Mutex::new(InboundIndex {
                by_mid: HashMap::new(),
                next_serial: 0,
            }),
            waiters: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Records the first observation of `message`, or hands back the
    /// existing exchange when `(src, mid)` was already seen.
    pub fn insert_if_absent(&self, src: SocketAddr, message: &Packet) -> InsertOutcome {
        let message_id = message.header.message_id;
        let key = (src, message_id);

        let exchange = {
            let mut inbound = self.inbound.lock().unwrap();
            if let Some(existing) = inbound.by_mid.get(&key) {
                return InsertOutcome::Duplicate(Arc::clone(existing));
            }

            let serial = inbound.next_serial;
            inbound.next_serial += 1;
            let exchange = Arc::new(Exchange {
                remote: src,
                message_id,
                token: message.get_token().to_vec(),
                kind: message.header.get_type(),
                serial,
                phase: Mutex::new(InboundPhase::AwaitingResponse { confirmed: false }),
            });
            inbound.by_mid.insert(key, Arc::clone(&exchange));
            exchange
        };

        let registry = self.this.clone();
        let lifetime = self.lifetime;
        let serial = exchange.serial;
        tokio::spawn(async move {
            sleep(lifetime).await;
            if let Some(registry) = registry.upgrade() {
                registry.evict(src, message_id, serial);
            }
        });

        trace!("recorded exchange mid {} from {}", message_id, src);
        InsertOutcome::Inserted(exchange)
    }

    /// Flips the exchange to confirmed, unless a response got there first.
    /// This transition and [`claim_response`](Self::claim_response) are the
    /// decision point between an empty ACK and a piggy-backed response:
    /// whichever happens first wins, and the loser emits nothing.
    pub fn mark_confirmed(&self, remote: SocketAddr, message_id: u16) -> bool {
        match self.find_by_mid(remote, message_id) {
            Some(exchange) => exchange.mark_confirmed(),
            None => false,
        }
    }

    /// Decides how the response to `(remote, request mid)` must be sent and
    /// claims the exchange so no second response can be attached.
    pub fn claim_response(&self, remote: SocketAddr, message_id: u16) -> ResponseMode {
        let exchange = match self.find_by_mid(remote, message_id) {
            Some(exchange) => exchange,
            None => return ResponseMode::Unmatched,
        };

        match exchange.claim() {
            None => ResponseMode::AlreadyResponded,
            Some(_) if !exchange.is_confirmable() => ResponseMode::NonConfirmable,
            Some(true) => ResponseMode::Separate,
            Some(false) => ResponseMode::Piggybacked,
        }
    }

    /// Caches the finalized response for duplicate replay. Must follow a
    /// successful claim.
    pub fn cache_response(&self, remote: SocketAddr, message_id: u16, response: Packet) {
        if let Some(exchange) = self.find_by_mid(remote, message_id) {
            exchange.store_response(response);
        }
    }

    pub fn find_by_mid(&self, remote: SocketAddr, message_id: u16) -> Option<Arc<Exchange>> {
        let inbound = self.inbound.lock().unwrap();
        inbound.by_mid.get(&(remote, message_id)).cloned()
    }

    fn evict(&self, remote: SocketAddr, message_id: u16, serial: u64) {
        let mut inbound = self.inbound.lock().unwrap();
        let key = (remote, message_id);
        let current = inbound.by_mid.get(&key).map_or(false, |e| e.serial == serial);
        if current {
            inbound.by_mid.remove(&key);
            debug!("evicted exchange mid {} from {}", message_id, remote);
        }
    }

    /// Registers a waiter for the response matching `(remote, token)`.
    pub fn register_waiter(&self, remote: SocketAddr, token: Vec<u8>, tx: oneshot::Sender<Packet>) {
        self.waiters.lock().unwrap().insert((remote, token), tx);
    }

    /// Hands `response` to the waiter registered for `(remote, token)`.
    /// Returns false when no request is waiting for that token.
    pub fn resolve_waiter(&self, remote: SocketAddr, token: &[u8], response: Packet) -> bool {
        let waiter = self
            .waiters
            .lock()
            .unwrap()
            .remove(&(remote, token.to_vec()));
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn remove_waiter(&self, remote: SocketAddr, token: &[u8]) {
        self.waiters.lock().unwrap().remove(&(remote, token.to_vec()));
    }

    #[cfg(test)]
    fn live_exchanges(&self) -> usize {
        self.inbound.lock().unwrap().by_mid.len()
    }
}
