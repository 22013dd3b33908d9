//! Message Interface
//!
//! A [`Message`] is the unit of data moved between a Sender and a Receiver.
//! The application supplies a tagged binary payload; the Sender stamps the
//! message with its identity and a sequence number just before it reaches
//! the wire. Receivers use that stamp to detect lost, duplicated or
//! reordered messages.
//!
//! Two messages are equal when they carry the same delivery identity
//! (sender instance and sequence number), independent of their payloads.
//! Use [`Message::payload_equals`] to compare payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity stamped onto a message by the Sender that transmits it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderInformation {
    /// The process that owns the Sender
    pub process_id: String,
    /// Unique identifier of the Sender instance
    pub instance_id: String,
    /// Position of the message in the Sender's stream, starting at 0
    pub sequence_number: i64,
}

/// What a message carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Application data with a routing tag
    Payload { tag: u16, data: Bytes },
    /// Reserved body announcing an orderly shutdown of the connection
    CloseCommunication,
}

/// Unit of communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    sender: Option<SenderInformation>,
    body: MessageBody,
}

impl Message {
    /// Create an application message
    pub fn new(tag: u16, data: impl Into<Bytes>) -> Self {
        Self {
            sender: None,
            body: MessageBody::Payload {
                tag,
                data: data.into(),
            },
        }
    }

    /// Create the close-communication sentinel
    pub fn close_communication() -> Self {
        Self {
            sender: None,
            body: MessageBody::CloseCommunication,
        }
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Payload tag, `None` for the close-communication sentinel
    pub fn tag(&self) -> Option<u16> {
        match &self.body {
            MessageBody::Payload { tag, .. } => Some(*tag),
            MessageBody::CloseCommunication => None,
        }
    }

    /// Payload bytes, `None` for the close-communication sentinel
    pub fn data(&self) -> Option<&Bytes> {
        match &self.body {
            MessageBody::Payload { data, .. } => Some(data),
            MessageBody::CloseCommunication => None,
        }
    }

    pub fn is_close_communication(&self) -> bool {
        matches!(self.body, MessageBody::CloseCommunication)
    }

    /// Stamp the message with the identity of the Sender transmitting it.
    ///
    /// Senders call this immediately before handing the message to the
    /// transport. Stamping again replaces the previous identity.
    pub fn set_sender_information(
        &mut self,
        process_id: impl Into<String>,
        instance_id: impl Into<String>,
        sequence_number: i64,
    ) {
        self.sender = Some(SenderInformation {
            process_id: process_id.into(),
            instance_id: instance_id.into(),
            sequence_number,
        });
    }

    /// Sender identity, or `None` if the message has not been sent yet
    pub fn sender_information(&self) -> Option<&SenderInformation> {
        self.sender.as_ref()
    }

    pub fn is_stamped(&self) -> bool {
        self.sender.is_some()
    }

    /// # Panics
    ///
    /// If the message has not passed through a Sender.
    pub fn sender_process_id(&self) -> &str {
        &self.stamped().process_id
    }

    /// # Panics
    ///
    /// If the message has not passed through a Sender.
    pub fn sender_instance_id(&self) -> &str {
        &self.stamped().instance_id
    }

    /// # Panics
    ///
    /// If the message has not passed through a Sender.
    pub fn sequence_number(&self) -> i64 {
        self.stamped().sequence_number
    }

    /// Compare payloads, ignoring sender identity
    pub fn payload_equals(&self, other: &Message) -> bool {
        self.body == other.body
    }

    fn stamped(&self) -> &SenderInformation {
        match &self.sender {
            Some(sender) => sender,
            None => panic!("Message not initialised: sender information is stamped by a Sender"),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        match (&self.sender, &other.sender) {
            (Some(a), Some(b)) => {
                a.sequence_number == b.sequence_number && a.instance_id == b.instance_id
            }
            _ => false,
        }
    }
}
