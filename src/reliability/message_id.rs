use log::trace;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Error;

/// Allocates 16-bit message IDs and keeps each one reserved for the
/// configured lifetime, so an ID is never reused while a peer may still
/// treat it as in flight.
///
/// The counter advances monotonically modulo 2^16 and skips IDs that are
/// still reserved; its starting point is random so ID sequences are not
/// predictable across restarts. Reservations expire after
/// `EXCHANGE_LIFETIME` by default and are released lazily on allocation.
pub struct MessageIdFactory {
    lifetime: Duration,
    state: Mutex<AllocationState>,
}

struct AllocationState {
    next: u16,
    reserved: HashSet<u16>,
    expiries: VecDeque<(Instant, u16)>,
}

impl MessageIdFactory {
    pub fn new(lifetime: Duration) -> MessageIdFactory {
        MessageIdFactory {
            lifetime,
            state: Mutex::new(AllocationState {
                next: rand::thread_rng().gen(),
                reserved: HashSet::new(),
                expiries: VecDeque::new(),
            }),
        }
    }

    /// Returns a message ID that is currently not reserved and reserves it
    /// until the allocation lifetime has passed.
    ///
    /// Fails with [`Error::NoFreeMessageIds`] when the whole ID space is
    /// reserved; the caller may retry once older reservations expire.
    pub fn allocate(&self) -> Result<u16, Error> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.release_expired(now);

        if state.reserved.len() > usize::from(u16::MAX) {
            return Err(Error::NoFreeMessageIds);
        }

        loop {
            let candidate = state.next;
            state.next = state.next.wrapping_add(1);
            if state.reserved.insert(candidate) {
                state.expiries.push_back((now + self.lifetime, candidate));
                trace!("allocated message ID {}", candidate);
                return Ok(candidate);
            }
        }
    }

    /// Number of IDs currently reserved.
    pub fn reserved(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.release_expired(Instant::now());
        state.reserved.len()
    }
}

impl AllocationState {
    fn release_expired(&mut self, now: Instant) {
        while let Some(&(deadline, id)) = self.expiries.front() {
            if deadline > now {
                break;
            }
            self.expiries.pop_front();
            self.reserved.remove(&id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::quickcheck;
    use std::thread::sleep;

    #[test]
    fn test_allocations_are_distinct() {
        let factory = MessageIdFactory::new(Duration::from_secs(247));
        let mut seen = HashSet::new();
        for _ in 0..4096 {
            assert!(seen.insert(factory.allocate().unwrap()));
        }
        assert_eq!(factory.reserved(), 4096);
    }

    #[test]
    fn test_exhaustion_fails_fast() {
        let factory = MessageIdFactory::new(Duration::from_secs(247));
        for _ in 0..=u16::MAX as usize {
            factory.allocate().unwrap();
        }
        assert!(matches!(factory.allocate(), Err(Error::NoFreeMessageIds)));
    }

    #[test]
    fn test_expired_reservations_are_recycled() {
        let factory = MessageIdFactory::new(Duration::from_millis(10));
        let first = factory.allocate().unwrap();
        sleep(Duration::from_millis(20));
        let mut recycled = false;
        for _ in 0..=u16::MAX as usize {
            if factory.allocate().unwrap() == first {
                recycled = true;
                break;
            }
        }
        assert!(recycled);
    }

    quickcheck! {
        fn prop_no_reuse_within_lifetime(count: u16) -> bool {
            let factory = MessageIdFactory::new(Duration::from_secs(247));
            let mut seen = HashSet::new();
            (0..count).all(|_| seen.insert(factory.allocate().unwrap()))
        }
    }
}
