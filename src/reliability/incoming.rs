use coap_lite::{CoapRequest, MessageClass, MessageType, Packet};
use log::{debug, trace};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::sleep;

use super::exchange::{ExchangeRegistry, InsertOutcome};
use super::{empty_ack, empty_reset};
use crate::params::TransmissionParameters;
use crate::server::MessageSender;

/// What the reactor should do with an inbound message once the message
/// layer has applied its deduplication and acknowledgement rules.
#[derive(Debug)]
pub enum InboundEvent {
    /// A fresh request for the dispatcher.
    Request(CoapRequest<SocketAddr>),
    /// A separate or non-confirmable response, to be matched by token.
    Response(Packet),
    /// An acknowledgement for a pending confirmable, carrying the
    /// piggy-backed response when the ACK was not empty.
    Acknowledgement {
        message_id: u16,
        response: Option<Packet>,
    },
    /// A reset for a pending confirmable.
    Reset { message_id: u16 },
    /// Fully handled inside the message layer: duplicate, ping, replayed
    /// response or garbage.
    Handled,
}

/// First stop for every decoded inbound message.
///
/// Confirmable requests are recorded for duplicate suppression and get an
/// empty ACK armed for `ACK_DELAY` from now; whether that ACK or a
/// piggy-backed response goes out is decided by the exchange registry's
/// atomic confirmation transition. Confirmable responses are acknowledged
/// immediately. Duplicates with a cached response are answered verbatim
/// without involving the upper layers.
pub struct IncomingReliabilityHandler {
    params: TransmissionParameters,
    exchanges: Arc<ExchangeRegistry>,
    outbound: MessageSender,
}

impl IncomingReliabilityHandler {
    pub fn new(
        params: TransmissionParameters,
        exchanges: Arc<ExchangeRegistry>,
        outbound: MessageSender,
    ) -> IncomingReliabilityHandler {
        IncomingReliabilityHandler {
            params,
            exchanges,
            outbound,
        }
    }

    pub fn handle(&self, message: Packet, src: SocketAddr) -> InboundEvent {
        match message.header.get_type() {
            MessageType::Confirmable => self.handle_confirmable(message, src),
            MessageType::NonConfirmable => self.handle_non_confirmable(message, src),
            MessageType::Acknowledgement => self.handle_acknowledgement(message, src),
            MessageType::Reset => InboundEvent::Reset {
                message_id: message.header.message_id,
            },
        }
    }

    fn handle_confirmable(&self, message: Packet, src: SocketAddr) -> InboundEvent {
        let message_id = message.header.message_id;

        match message.header.code {
            // Empty CON is a CoAP ping, answered with a reset.
            MessageClass::Empty => {
                debug!("ping from {}, answering with RST mid {}", src, message_id);
                let _ = self.outbound.send((empty_reset(message_id), src));
                InboundEvent::Handled
            }
            MessageClass::Reserved(_) => {
                debug!("reserved code class from {}, answering with RST", src);
                let _ = self.outbound.send((empty_reset(message_id), src));
                InboundEvent::Handled
            }
            MessageClass::Request(_) => match self.exchanges.insert_if_absent(src, &message) {
                InsertOutcome::Duplicate(exchange) => {
                    match exchange.cached_response() {
                        Some(response) => {
                            debug!(
                                "replaying cached response for duplicate mid {} from {}",
                                exchange.message_id(),
                                exchange.remote()
                            );
                            let _ = self.outbound.send((response, src));
                        }
                        // Duplicate of an in-flight request: drop silently.
                        None => trace!("dropping in-flight duplicate mid {} from {}", message_id, src),
                    }
                    InboundEvent::Handled
                }
                InsertOutcome::Inserted(_) => {
                    self.arm_empty_ack(src, message_id);
                    InboundEvent::Request(CoapRequest::from_packet(message, src))
                }
            },
            MessageClass::Response(_) => {
                // A separate response: acknowledge right away, then let the
                // reactor match it to the originating request by token.
                match self.exchanges.insert_if_absent(src, &message) {
                    InsertOutcome::Duplicate(_) => {
                        // Our previous ACK was lost; repeat it, nothing more.
                        let _ = self.outbound.send((empty_ack(message_id), src));
                        InboundEvent::Handled
                    }
                    InsertOutcome::Inserted(_) => {
                        let _ = self.outbound.send((empty_ack(message_id), src));
                        InboundEvent::Response(message)
                    }
                }
            }
        }
    }

    fn handle_non_confirmable(&self, message: Packet, src: SocketAddr) -> InboundEvent {
        let message_id = message.header.message_id;

        match message.header.code {
            MessageClass::Request(_) => match self.exchanges.insert_if_absent(src, &message) {
                InsertOutcome::Duplicate(exchange) => {
                    if let Some(response) = exchange.cached_response() {
                        let _ = self.outbound.send((response, src));
                    }
                    InboundEvent::Handled
                }
                InsertOutcome::Inserted(_) => {
                    InboundEvent::Request(CoapRequest::from_packet(message, src))
                }
            },
            MessageClass::Response(_) => match self.exchanges.insert_if_absent(src, &message) {
                InsertOutcome::Duplicate(_) => InboundEvent::Handled,
                InsertOutcome::Inserted(_) => InboundEvent::Response(message),
            },
            _ => {
                trace!("dropping NON with empty or reserved code from {}", src);
                InboundEvent::Handled
            }
        }
    }

    fn handle_acknowledgement(&self, message: Packet, src: SocketAddr) -> InboundEvent {
        let message_id = message.header.message_id;

        match message.header.code {
            MessageClass::Empty => InboundEvent::Acknowledgement {
                message_id,
                response: None,
            },
            MessageClass::Response(_) => InboundEvent::Acknowledgement {
                message_id,
                response: Some(message),
            },
            // An ACK may only carry an empty or response code.
            _ => {
                debug!("ACK with request code from {}, answering with RST", src);
                let _ = self.outbound.send((empty_reset(message_id), src));
                InboundEvent::Handled
            }
        }
    }

    /// Schedules the empty acknowledgement for a confirmable request. The
    /// timer only emits if no piggy-backed response claimed the exchange
    /// before `ACK_DELAY` elapsed.
    fn arm_empty_ack(&self, remote: SocketAddr, message_id: u16) {
        let exchanges = Arc::clone(&self.exchanges);
        let outbound = self.outbound.clone();
        let delay = self.params.ack_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            if exchanges.mark_confirmed(remote, message_id) {
                debug!(
                    "no response within ack delay, sending empty ACK mid {} to {}",
                    message_id, remote
                );
                let _ = outbound.send((empty_ack(message_id), remote));
            }
        });
    }
}
