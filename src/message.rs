//!
//! message.rs
//! The single record exchanged between the collage coordinator and its
//! participants, plus the byte codec used on the datagram transport.
//!
extern crate serde;
extern crate bincode;

///
/// MessageType
/// Message type codes that the 2PC parties send or receive.
///
#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Prepare,     // Coordinator proposes: vote on promising these sources
    VoteCommit,  // Participant promises its sources in phase 1
    VoteAbort,   // Participant refuses in phase 1
    CommitSuc,   // Coordinator decided commit in phase 2
    CommitFail,  // Coordinator decided abort in phase 2
    Ack,         // Participant confirms a phase 2 decision
}

///
/// Message
/// The record that travels on the wire. `file_name` doubles as the
/// transaction fingerprint: it is unique among live transactions and ties
/// together every message of one collage commit on both ends. `content`
/// carries the artifact bytes (only meaningful on Prepare) and `sources`
/// the file names the receiving participant is being asked about.
///
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub mtype: MessageType,
    pub file_name: String,
    pub content: Vec<u8>,
    pub sources: Vec<String>,
}

impl Message {
    pub fn new(t: MessageType, file_name: &str, content: Vec<u8>, sources: Vec<String>) -> Message {
        Message {
            mtype: t,
            file_name: file_name.to_string(),
            content: content,
            sources: sources,
        }
    }

    /// Shorthand for the payload-free record types (votes and acks).
    pub fn control(t: MessageType, file_name: &str) -> Message {
        Message::new(t, file_name, Vec::new(), Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap()
    }

    ///
    /// decode()
    /// Parses a datagram back into a Message. Malformed input is an error
    /// the receiver logs and drops, the same as a lost message.
    ///
    pub fn decode(raw: &[u8]) -> Result<Message, bincode::Error> {
        bincode::deserialize(raw)
    }
}
