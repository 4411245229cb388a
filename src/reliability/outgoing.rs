use coap_lite::{CoapResponse, MessageType, Packet};
use log::{debug, trace, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::exchange::{ExchangeRegistry, ResponseMode};
use super::message_id::MessageIdFactory;
use super::retransmission::{ConfirmableOutcome, RetransmissionScheduler};
use crate::error::Error;
use crate::server::MessageSender;

/// Applies message-layer typing rules to everything handed down for
/// transmission.
///
/// Responses are classified against their originating inbound exchange:
/// piggy-backed ACK while the request is unconfirmed, separate confirmable
/// with a fresh message ID once the empty ACK went out, non-confirmable
/// when the exchange is gone. New outbound confirmables register with the
/// retransmission scheduler. Internally generated empty ACKs and resets
/// bypass this handler entirely.
pub struct OutgoingReliabilityHandler {
    exchanges: Arc<ExchangeRegistry>,
    message_ids: Arc<MessageIdFactory>,
    scheduler: Arc<RetransmissionScheduler>,
    outbound: MessageSender,
}

impl OutgoingReliabilityHandler {
    pub fn new(
        exchanges: Arc<ExchangeRegistry>,
        message_ids: Arc<MessageIdFactory>,
        scheduler: Arc<RetransmissionScheduler>,
        outbound: MessageSender,
    ) -> OutgoingReliabilityHandler {
        OutgoingReliabilityHandler {
            exchanges,
            message_ids,
            scheduler,
            outbound,
        }
    }

    /// Transmits the response to the inbound exchange `(remote, request_mid)`.
    pub fn send_response(
        &self,
        remote: SocketAddr,
        request_mid: u16,
        mut response: CoapResponse,
    ) -> Result<(), Error> {
        match self.exchanges.claim_response(remote, request_mid) {
            ResponseMode::Piggybacked => {
                response.message.header.set_type(MessageType::Acknowledgement);
                response.message.header.message_id = request_mid;
                self.exchanges
                    .cache_response(remote, request_mid, response.message.clone());
                let _ = self.outbound.send((response.message, remote));
            }
            ResponseMode::Separate => {
                let message_id = self.message_ids.allocate()?;
                response.message.header.set_type(MessageType::Confirmable);
                response.message.header.message_id = message_id;
                self.exchanges
                    .cache_response(remote, request_mid, response.message.clone());
                debug!(
                    "sending separate response mid {} for request mid {} to {}",
                    message_id, request_mid, remote
                );
                let outcome = self.scheduler.register(remote, response.message);
                watch_separate_response(remote, message_id, outcome);
            }
            ResponseMode::NonConfirmable => {
                let message_id = self.message_ids.allocate()?;
                response.message.header.set_type(MessageType::NonConfirmable);
                response.message.header.message_id = message_id;
                self.exchanges
                    .cache_response(remote, request_mid, response.message.clone());
                let _ = self.outbound.send((response.message, remote));
            }
            ResponseMode::Unmatched => {
                // The exchange was evicted before the handler resolved; the
                // peer may still be listening, so send an unreliable copy.
                let message_id = self.message_ids.allocate()?;
                response.message.header.set_type(MessageType::NonConfirmable);
                response.message.header.message_id = message_id;
                let _ = self.outbound.send((response.message, remote));
            }
            ResponseMode::AlreadyResponded => {
                warn!(
                    "discarding second response for exchange mid {} to {}",
                    request_mid, remote
                );
            }
        }
        Ok(())
    }

    /// Sends a new confirmable with a fresh message ID. The returned channel
    /// resolves on ACK, RST or retransmission timeout.
    pub fn send_confirmable(
        &self,
        remote: SocketAddr,
        mut message: Packet,
    ) -> Result<oneshot::Receiver<ConfirmableOutcome>, Error> {
        let message_id = self.message_ids.allocate()?;
        message.header.set_type(MessageType::Confirmable);
        message.header.message_id = message_id;
        Ok(self.scheduler.register(remote, message))
    }

    /// Sends a new non-confirmable with a fresh message ID, fire and forget.
    pub fn send_non_confirmable(&self, remote: SocketAddr, mut message: Packet) -> Result<u16, Error> {
        let message_id = self.message_ids.allocate()?;
        message.header.set_type(MessageType::NonConfirmable);
        message.header.message_id = message_id;
        let _ = self.outbound.send((message, remote));
        Ok(message_id)
    }

    /// Resolves the pending confirmable matching an inbound ACK.
    pub fn acknowledged(&self, remote: SocketAddr, message_id: u16, response: Option<Packet>) {
        if !self.scheduler.acknowledged(remote, message_id, response) {
            trace!("ACK for unknown mid {} from {}", message_id, remote);
        }
    }

    /// Resolves the pending confirmable matching an inbound RST.
    pub fn reset_received(&self, remote: SocketAddr, message_id: u16) {
        if !self.scheduler.reset(remote, message_id) {
            trace!("RST for unknown mid {} from {}", message_id, remote);
        }
    }
}

fn watch_separate_response(
    remote: SocketAddr,
    message_id: u16,
    outcome: oneshot::Receiver<ConfirmableOutcome>,
) {
    tokio::spawn(async move {
        match outcome.await {
            Ok(ConfirmableOutcome::Acknowledged { .. }) => {
                debug!("separate response mid {} to {} acknowledged", message_id, remote)
            }
            Ok(ConfirmableOutcome::Reset) => {
                warn!("peer {} refused separate response mid {}", remote, message_id)
            }
            Ok(ConfirmableOutcome::TimedOut) => {
                warn!("separate response mid {} to {} timed out", message_id, remote)
            }
            Err(_) => {}
        }
    });
}
