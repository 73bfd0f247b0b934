//! Pipelined remote references.

use std::fmt;
use std::sync::{Arc, Weak};

use captp_wire::CallTarget;

use crate::connection::{CapTp, Inner};
use crate::error::CapTpError;
use crate::promise::{Settled, SettleCell};
use crate::value::{CapRef, CapValue, Resolution};

/// A reference to a peer-owned value.
///
/// A `Remote` is created pending, addressed at a question this side
/// issued or at an imported slot. Its defining property is that
/// [`get`](Remote::get) and [`call`](Remote::call) do not wait for it
/// to settle: each issues a fresh question against the target
/// immediately, so a chain of operations costs one round trip per
/// *resolution* rather than one per step. Imported object slots settle
/// on creation as a *presence* — a remote that is itself the value.
#[derive(Clone)]
pub struct Remote {
    pub(crate) conn: Weak<Inner>,
    pub(crate) target: CallTarget,
    pub(crate) cell: Arc<SettleCell>,
}

impl Remote {
    pub(crate) fn new(conn: Weak<Inner>, target: CallTarget, cell: Arc<SettleCell>) -> Self {
        Self { conn, target, cell }
    }

    /// Read property `prop` of the eventual value. Sends a `CTP_CALL`
    /// immediately and returns the new question's remote.
    pub fn get(&self, prop: &str) -> Result<Remote, CapTpError> {
        let conn = self.conn.upgrade().ok_or(CapTpError::ConnectionDropped)?;
        CapTp::from_inner(conn).pipeline(self.target.clone(), prop, None)
    }

    /// Invoke method `method` of the eventual value with `args`. Sends a
    /// `CTP_CALL` immediately and returns the new question's remote.
    pub fn call(&self, method: &str, args: Vec<CapValue>) -> Result<Remote, CapTpError> {
        let conn = self.conn.upgrade().ok_or(CapTpError::ConnectionDropped)?;
        CapTp::from_inner(conn).pipeline(self.target.clone(), method, Some(args))
    }

    /// Wait for settlement. A presence resolves to itself as a
    /// capability value.
    pub async fn resolution(&self) -> Resolution {
        match self.cell.wait().await {
            Settled::Fulfilled(v) => Ok(v),
            Settled::Rejected(r) => Err(r),
            Settled::Presence => Ok(CapValue::Cap(CapRef::Remote(self.clone()))),
        }
    }

    /// True once settled, whether fulfilled, rejected, or a presence.
    pub fn is_settled(&self) -> bool {
        self.cell.peek().is_some()
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.cell) as usize
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("target", &self.target)
            .field("cell", &self.cell)
            .finish()
    }
}
