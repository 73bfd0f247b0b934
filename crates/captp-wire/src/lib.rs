//! CapTP wire vocabulary — slot naming and protocol messages.
//!
//! This crate defines the data that crosses the wire between two CapTP
//! endpoints and nothing else: the slot identifier grammar, the
//! marshalled-data envelope ([`CapData`]), and the five protocol
//! messages. The engine that gives these meaning lives in `captp-core`.

pub mod message;
pub mod slot;

pub use message::{
    decode_message, encode_message, CallTarget, CapData, CtpMessage, QCLASS,
};
pub use slot::{Slot, SlotDir, SlotKind, SlotParseError};
