use rand::Rng;
use std::time::Duration;

/// RFC 7252 section 4.8 transmission parameters.
///
/// Every timer in the message layer is derived from this set. The defaults
/// are the protocol defaults; deployments with different round-trip
/// characteristics may tune them, as long as `ack_random_factor` stays at or
/// above 1.0.
#[derive(Clone, Debug)]
pub struct TransmissionParameters {
    /// Initial retransmission timeout lower bound (`ACK_TIMEOUT`).
    pub ack_timeout: Duration,
    /// Upper bound multiplier for the initial timeout (`ACK_RANDOM_FACTOR`).
    pub ack_random_factor: f64,
    /// Maximum number of retransmissions of a confirmable (`MAX_RETRANSMIT`).
    pub max_retransmit: u32,
    /// Maximum simultaneous outstanding confirmables per peer (`NSTART`).
    pub nstart: usize,
    /// Response spreading interval for multicast (`DEFAULT_LEISURE`).
    pub default_leisure: Duration,
    /// Upper bound on bytes per second sent to an unresponsive peer
    /// (`PROBING_RATE`).
    pub probing_rate: u32,
    /// How long a message ID stays tied to an exchange (`EXCHANGE_LIFETIME`).
    pub exchange_lifetime: Duration,
    /// Lifetime of a non-confirmable message ID (`NON_LIFETIME`).
    pub non_lifetime: Duration,
    /// How long to wait for a piggy-backed response before an empty ACK
    /// goes out. Must not exceed `ack_timeout`.
    pub ack_delay: Duration,
}

impl Default for TransmissionParameters {
    fn default() -> TransmissionParameters {
        TransmissionParameters {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            default_leisure: Duration::from_secs(5),
            probing_rate: 1,
            exchange_lifetime: Duration::from_secs(247),
            non_lifetime: Duration::from_secs(145),
            ack_delay: Duration::from_secs(2),
        }
    }
}

impl TransmissionParameters {
    /// `MAX_TRANSMIT_SPAN`: the time from the first transmission of a
    /// confirmable to its last retransmission (45 s with defaults).
    pub fn max_transmit_span(&self) -> Duration {
        let doublings = ((1u64 << self.max_retransmit) - 1) as f64;
        self.ack_timeout.mul_f64(doublings * self.ack_random_factor)
    }

    /// `MAX_TRANSMIT_WAIT`: the time from the first transmission of a
    /// confirmable to giving up on an acknowledgement (93 s with defaults).
    pub fn max_transmit_wait(&self) -> Duration {
        let doublings = ((1u64 << (self.max_retransmit + 1)) - 1) as f64;
        self.ack_timeout.mul_f64(doublings * self.ack_random_factor)
    }

    /// Draws a fresh initial retransmission timeout, uniformly random in
    /// `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]`.
    pub fn initial_retransmission_timeout(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0..=self.ack_random_factor);
        self.ack_timeout.mul_f64(factor)
    }
}
