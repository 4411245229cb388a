//! The message-layer reliability core: everything between a decoded
//! datagram and the request/response abstraction.
//!
//! Inbound traffic flows through [`incoming::IncomingReliabilityHandler`],
//! outbound traffic through [`outgoing::OutgoingReliabilityHandler`]. Both
//! consult the shared [`exchange::ExchangeRegistry`];
//! [`retransmission::RetransmissionScheduler`] tracks outbound confirmables
//! and [`message_id::MessageIdFactory`] hands out message IDs.

use coap_lite::{MessageClass, MessageType, Packet};

pub mod exchange;
pub mod incoming;
pub mod message_id;
pub mod outgoing;
pub mod retransmission;

/// Builds an empty acknowledgement for `message_id`.
pub fn empty_ack(message_id: u16) -> Packet {
    empty_message(MessageType::Acknowledgement, message_id)
}

/// Builds a reset for `message_id`.
pub fn empty_reset(message_id: u16) -> Packet {
    empty_message(MessageType::Reset, message_id)
}

fn empty_message(kind: MessageType, message_id: u16) -> Packet {
    let mut message = Packet::new();
    message.header.set_version(1);
    message.header.set_type(kind);
    message.header.code = MessageClass::Empty;
    message.header.message_id = message_id;
    message
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_messages() {
        let ack = empty_ack(0x1234);
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.code, MessageClass::Empty);
        assert_eq!(ack.header.message_id, 0x1234);
        assert!(ack.get_token().is_empty());
        assert!(ack.payload.is_empty());

        let reset = empty_reset(0x4321);
        assert_eq!(reset.header.get_type(), MessageType::Reset);
        assert_eq!(reset.header.code, MessageClass::Empty);
        assert_eq!(reset.header.message_id, 0x4321);
    }
}
