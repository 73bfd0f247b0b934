//! Promise settlement.
//!
//! Every pending value in the engine — a question awaiting its
//! `CTP_RETURN`, an imported promise awaiting `CTP_RESOLVE`, an answer
//! being computed for the peer — settles through one cell type. A cell
//! settles exactly once and supports any number of waiters.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::value::{CapValue, Rejection, Resolution};

/// A settled state. `Presence` occurs only for imported object slots,
/// where the remote reference itself is the value.
#[derive(Debug, Clone)]
pub(crate) enum Settled {
    Presence,
    Fulfilled(CapValue),
    Rejected(Rejection),
}

/// A settle-once cell.
pub(crate) struct SettleCell {
    tx: watch::Sender<Option<Settled>>,
}

impl SettleCell {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new(Self { tx })
    }

    /// Settle the cell. The first settlement wins; the return value
    /// reports whether this call was it.
    pub fn settle(&self, settled: Settled) -> bool {
        self.tx.send_if_modified(|cur| {
            if cur.is_none() {
                *cur = Some(settled);
                true
            } else {
                false
            }
        })
    }

    pub fn fulfill(&self, v: CapValue) -> bool {
        self.settle(Settled::Fulfilled(v))
    }

    pub fn reject(&self, r: Rejection) -> bool {
        self.settle(Settled::Rejected(r))
    }

    /// Current settlement, if any.
    pub fn peek(&self) -> Option<Settled> {
        self.tx.borrow().clone()
    }

    /// Wait for settlement.
    pub async fn wait(&self) -> Settled {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(s) = rx.borrow_and_update().clone() {
                return s;
            }
            if rx.changed().await.is_err() {
                return Settled::Rejected(Rejection::message("settlement cell dropped"));
            }
        }
    }
}

impl fmt::Debug for SettleCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.tx.borrow() {
            None => f.write_str("SettleCell(pending)"),
            Some(s) => write!(f, "SettleCell({s:?})"),
        }
    }
}

/// A promise created on this side of the connection. Clones share one
/// settlement. Passing it through the protocol before it settles is
/// what lets the peer pipeline onto values that do not exist yet.
#[derive(Clone, Debug)]
pub struct LocalPromise {
    cell: Arc<SettleCell>,
}

impl LocalPromise {
    /// A pending promise and the resolver that settles it.
    pub fn new() -> (LocalPromise, LocalResolver) {
        let cell = SettleCell::new();
        (LocalPromise { cell: cell.clone() }, LocalResolver { cell })
    }

    /// An already-fulfilled promise.
    pub fn fulfilled(v: impl Into<CapValue>) -> LocalPromise {
        let cell = SettleCell::new();
        cell.fulfill(v.into());
        LocalPromise { cell }
    }

    /// An already-rejected promise.
    pub fn rejected(r: impl Into<Rejection>) -> LocalPromise {
        let cell = SettleCell::new();
        cell.reject(r.into());
        LocalPromise { cell }
    }

    /// Wait for settlement.
    pub async fn wait(&self) -> Resolution {
        match self.cell.wait().await {
            Settled::Fulfilled(v) => Ok(v),
            Settled::Rejected(r) => Err(r),
            Settled::Presence => Err(Rejection::message("local promise settled as presence")),
        }
    }

    pub(crate) fn cell(&self) -> &Arc<SettleCell> {
        &self.cell
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.cell) as usize
    }
}

/// Settles its paired promise; the first settlement wins.
#[derive(Debug)]
pub struct LocalResolver {
    cell: Arc<SettleCell>,
}

impl LocalResolver {
    /// Fulfill the promise. Returns false if it was already settled.
    pub fn fulfill(&self, v: impl Into<CapValue>) -> bool {
        self.cell.fulfill(v.into())
    }

    /// Reject the promise. Returns false if it was already settled.
    pub fn reject(&self, r: impl Into<Rejection>) -> bool {
        self.cell.reject(r.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fulfill_wakes_waiter() {
        let (p, r) = LocalPromise::new();
        let p2 = p.clone();
        let waiter = tokio::spawn(async move { p2.wait().await });
        r.fulfill(CapValue::Int(7));
        assert_eq!(waiter.await.unwrap(), Ok(CapValue::Int(7)));
    }

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let (p, r) = LocalPromise::new();
        assert!(r.fulfill(CapValue::Int(1)));
        assert!(!r.reject(Rejection::message("too late")));
        assert_eq!(p.wait().await, Ok(CapValue::Int(1)));
    }

    #[tokio::test]
    async fn test_many_waiters() {
        let (p, r) = LocalPromise::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.wait().await })
            })
            .collect();
        r.reject(Rejection::message("no"));
        for w in waiters {
            assert_eq!(w.await.unwrap(), Err(Rejection::message("no")));
        }
    }

    #[tokio::test]
    async fn test_wait_after_settlement() {
        let p = LocalPromise::fulfilled(CapValue::Bool(true));
        assert_eq!(p.wait().await, Ok(CapValue::Bool(true)));
        assert_eq!(p.wait().await, Ok(CapValue::Bool(true)));
    }
}
