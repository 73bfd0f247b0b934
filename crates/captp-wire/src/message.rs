//! CapTP protocol messages.
//!
//! All traffic between two CapTP endpoints consists of five tagged
//! records, JSON-encoded. Field names follow the reference protocol
//! (`questionID`, `answerID`, `promiseID`, `res`/`rej`,
//! `result`/`exception`) so the wire form is interoperable.

use serde::{Deserialize, Serialize};

/// Marshalled data: a JSON body in which every capability position has
/// been replaced by `{"@qclass":"slot","index":i}` referring to
/// `slots[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData {
    /// Serialized JSON text.
    pub body: String,
    /// Slot strings, one per distinct capability in the body.
    pub slots: Vec<String>,
}

/// Reserved key marking a capability escape inside a `CapData` body.
pub const QCLASS: &str = "@qclass";

/// The target of a `CTP_CALL`: a question id when pipelining onto a
/// result still in flight on the callee, otherwise a slot string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallTarget {
    /// A question id chosen by the caller, resolved through the callee's
    /// answers table.
    Question(u64),
    /// A slot string, resolved through the callee's import path.
    Slot(String),
}

/// A CapTP protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CtpMessage {
    /// Ask the peer for its bootstrap object.
    #[serde(rename = "CTP_BOOTSTRAP")]
    Bootstrap {
        #[serde(rename = "questionID")]
        question_id: u64,
    },
    /// Invoke a method on, or read a property of, a remote value.
    #[serde(rename = "CTP_CALL")]
    Call {
        #[serde(rename = "questionID")]
        question_id: u64,
        target: CallTarget,
        /// Marshalled `[prop]` for a property get, `[prop, args]` for a
        /// method apply.
        method: CapData,
    },
    /// The answer to a question the peer issued.
    #[serde(rename = "CTP_RETURN")]
    Return {
        #[serde(rename = "answerID")]
        answer_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<CapData>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<CapData>,
    },
    /// Settlement of a promise this side previously exported.
    #[serde(rename = "CTP_RESOLVE")]
    Resolve {
        #[serde(rename = "promiseID")]
        promise_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        res: Option<CapData>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rej: Option<CapData>,
    },
    /// Connection-fatal failure: rejects all pending work on both sides.
    /// The exception is plain JSON data, not `CapData` — an aborted
    /// connection can no longer translate slots.
    #[serde(rename = "CTP_ABORT")]
    Abort { exception: serde_json::Value },
}

impl CtpMessage {
    /// The wire tag of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CtpMessage::Bootstrap { .. } => "CTP_BOOTSTRAP",
            CtpMessage::Call { .. } => "CTP_CALL",
            CtpMessage::Return { .. } => "CTP_RETURN",
            CtpMessage::Resolve { .. } => "CTP_RESOLVE",
            CtpMessage::Abort { .. } => "CTP_ABORT",
        }
    }
}

/// Encode a message to JSON bytes.
pub fn encode_message(msg: &CtpMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Parse JSON bytes into a message.
pub fn decode_message(body: &[u8]) -> Result<CtpMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
