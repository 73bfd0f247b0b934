//! CapTP protocol engine.
//!
//! A bidirectional remote-object-capability messaging engine for two
//! mutually suspicious endpoints joined by an ordered, reliable message
//! channel. Each side exports live object references, invokes methods
//! on the peer's objects, and pipelines calls onto results that have
//! not settled yet.
//!
//! ## Architecture
//!
//! - **[`CapTp`]**: one engine per connection — dispatch, bootstrap,
//!   abort.
//! - **[`CapValue`]**: the value graph — data travels by copy,
//!   capabilities by reference.
//! - **[`CapObject`]**: the trait through which the engine invokes
//!   host objects the peer calls.
//! - **[`Remote`]**: a pipelined reference to a peer-owned value.
//! - **[`LocalPromise`]**: a settleable value that can cross the wire
//!   before it settles.
//!
//! The transport is a collaborator, not part of this crate: it supplies
//! the send function to [`CapTp::new`] and feeds inbound messages to
//! [`CapTp::dispatch`], preserving send order.

pub mod connection;
pub mod error;
mod marshal;
pub mod promise;
pub mod remote;
mod table;
pub mod value;

pub use connection::{Bootstrap, CapTp};
pub use error::{CapTpError, CapTpResult};
pub use marshal::MarshalError;
pub use promise::{LocalPromise, LocalResolver};
pub use remote::Remote;
pub use table::TableStats;
pub use value::{CapObject, CapRef, CapValue, Rejection, Resolution};
