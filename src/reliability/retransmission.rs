use coap_lite::Packet;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::params::TransmissionParameters;
use crate::server::MessageSender;

/// Terminal outcome of one outbound confirmable.
#[derive(Debug)]
pub enum ConfirmableOutcome {
    /// The peer acknowledged the message. `response` carries the
    /// piggy-backed response when the ACK was not empty.
    Acknowledged { response: Option<Packet> },
    /// The peer rejected the message with a reset.
    Reset,
    /// All retransmissions elapsed without an ACK or RST.
    TimedOut,
}

struct PendingConfirmable {
    message: Packet,
    attempt: u32,
    notify: Option<oneshot::Sender<ConfirmableOutcome>>,
    timer: Option<JoinHandle<()>>,
}

/// Tracks outbound confirmables and retransmits them with exponential
/// back-off until they are acknowledged, reset or exhausted.
///
/// The initial interval is drawn randomly from
/// `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]` and doubles on every
/// retransmission; after `MAX_RETRANSMIT` unanswered retransmissions the
/// final interval elapses and the exchange resolves to
/// [`ConfirmableOutcome::TimedOut`]. A late ACK arriving between
/// retransmissions still closes the exchange. Retransmissions go out
/// through the reactor's outbound queue, never directly to the socket.
pub struct RetransmissionScheduler {
    params: TransmissionParameters,
    outbound: MessageSender,
    pending: Arc<Mutex<HashMap<(SocketAddr, u16), PendingConfirmable>>>,
}

impl RetransmissionScheduler {
    pub fn new(params: TransmissionParameters, outbound: MessageSender) -> RetransmissionScheduler {
        RetransmissionScheduler {
            params,
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Transmits `message` to `remote` and tracks it. The returned channel
    /// resolves exactly once, on ACK, RST or retransmission timeout.
    ///
    /// The caller must hand in a message ID that is not already pending
    /// toward `remote`; the message-ID factory guarantees this.
    pub fn register(
        &self,
        remote: SocketAddr,
        message: Packet,
    ) -> oneshot::Receiver<ConfirmableOutcome> {
        let (tx, rx) = oneshot::channel();
        let message_id = message.header.message_id;
        let key = (remote, message_id);

        let _ = self.outbound.send((message.clone(), remote));

        self.pending.lock().unwrap().insert(
            key,
            PendingConfirmable {
                message,
                attempt: 0,
                notify: Some(tx),
                timer: None,
            },
        );

        let pending = Arc::clone(&self.pending);
        let outbound = self.outbound.clone();
        let max_retransmit = self.params.max_retransmit;
        let mut interval = self.params.initial_retransmission_timeout();

        let timer = tokio::spawn(async move {
            loop {
                sleep(interval).await;

                let retransmission = {
                    let mut pending = pending.lock().unwrap();
                    match pending.get_mut(&key) {
                        // Resolved while we slept.
                        None => return,
                        Some(entry) if entry.attempt < max_retransmit => {
                            entry.attempt += 1;
                            Some((entry.message.clone(), entry.attempt))
                        }
                        // Retransmissions exhausted.
                        Some(_) => None,
                    }
                };

                match retransmission {
                    Some((message, attempt)) => {
                        debug!(
                            "retransmitting mid {} to {} (attempt {})",
                            message_id, remote, attempt
                        );
                        let _ = outbound.send((message, remote));
                        interval *= 2;
                    }
                    None => {
                        if let Some(mut entry) = pending.lock().unwrap().remove(&key) {
                            if let Some(notify) = entry.notify.take() {
                                let _ = notify.send(ConfirmableOutcome::TimedOut);
                            }
                        }
                        warn!("confirmable mid {} to {} timed out", message_id, remote);
                        return;
                    }
                }
            }
        });

        if let Some(entry) = self.pending.lock().unwrap().get_mut(&key) {
            entry.timer = Some(timer);
        } else {
            // Resolved before the timer handle landed; the task will notice
            // the missing entry on its first tick.
            timer.abort();
        }

        rx
    }

    /// Resolves the pending confirmable `(remote, mid)` as acknowledged.
    /// Returns false when nothing was pending under that key.
    pub fn acknowledged(
        &self,
        remote: SocketAddr,
        message_id: u16,
        response: Option<Packet>,
    ) -> bool {
        self.finish(
            remote,
            message_id,
            ConfirmableOutcome::Acknowledged { response },
        )
    }

    /// Resolves the pending confirmable `(remote, mid)` as reset by the peer.
    pub fn reset(&self, remote: SocketAddr, message_id: u16) -> bool {
        self.finish(remote, message_id, ConfirmableOutcome::Reset)
    }

    /// Number of confirmables currently awaiting an ACK.
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn finish(&self, remote: SocketAddr, message_id: u16, outcome: ConfirmableOutcome) -> bool {
        let entry = self.pending.lock().unwrap().remove(&(remote, message_id));
        match entry {
            Some(mut entry) => {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                if let Some(notify) = entry.notify.take() {
                    let _ = notify.send(outcome);
                }
                true
            }
            None => {
                trace!("no pending confirmable mid {} for {}", message_id, remote);
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use coap_lite::{MessageClass, MessageType};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn remote() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn confirmable(message_id: u16) -> Packet {
        let mut message = Packet::new();
        message.header.set_version(1);
        message.header.set_type(MessageType::Confirmable);
        message.header.code = MessageClass::Request(coap_lite::RequestType::Get);
        message.header.message_id = message_id;
        message
    }

    fn deterministic_params() -> TransmissionParameters {
        TransmissionParameters {
            ack_random_factor: 1.0,
            ..TransmissionParameters::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_schedule_doubles_until_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = RetransmissionScheduler::new(deterministic_params(), tx);

        let start = Instant::now();
        let outcome = scheduler.register(remote(), confirmable(0x2001));

        // Initial transmission plus four retransmissions at 2, 6, 14, 30 s.
        let mut offsets = Vec::new();
        for _ in 0..5 {
            rx.recv().await.unwrap();
            offsets.push(start.elapsed());
        }
        assert_eq!(
            offsets,
            vec![
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(6),
                Duration::from_secs(14),
                Duration::from_secs(30),
            ]
        );

        // The final 32 s interval elapses without an ACK.
        let result = outcome.await.unwrap();
        assert!(matches!(result, ConfirmableOutcome::TimedOut));
        assert_eq!(start.elapsed(), Duration::from_secs(62));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledgement_stops_retransmission() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = RetransmissionScheduler::new(deterministic_params(), tx);

        let outcome = scheduler.register(remote(), confirmable(0x2002));
        rx.recv().await.unwrap();

        assert!(scheduler.acknowledged(remote(), 0x2002, None));
        let result = outcome.await.unwrap();
        assert!(matches!(
            result,
            ConfirmableOutcome::Acknowledged { response: None }
        ));

        // No further copies show up even after the whole schedule.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_exchange_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = RetransmissionScheduler::new(deterministic_params(), tx);

        let outcome = scheduler.register(remote(), confirmable(0x2003));
        rx.recv().await.unwrap();

        assert!(scheduler.reset(remote(), 0x2003));
        assert!(matches!(outcome.await.unwrap(), ConfirmableOutcome::Reset));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_acknowledgement_after_retransmissions() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = RetransmissionScheduler::new(deterministic_params(), tx);

        let outcome = scheduler.register(remote(), confirmable(0x2004));
        rx.recv().await.unwrap();

        // Two retransmissions pass before the ACK shows up.
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert!(scheduler.acknowledged(remote(), 0x2004, None));
        assert!(matches!(
            outcome.await.unwrap(),
            ConfirmableOutcome::Acknowledged { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_acknowledgement_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let scheduler = RetransmissionScheduler::new(deterministic_params(), tx);
        assert!(!scheduler.acknowledged(remote(), 0x2005, None));
        assert!(!scheduler.reset(remote(), 0x2005));
    }
}
