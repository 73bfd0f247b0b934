//! The connection engine — construction, dispatch, and teardown.
//!
//! One [`CapTp`] engine manages one connection to one peer: it owns the
//! reference tables, routes the five protocol messages, issues
//! questions for outbound calls, and delivers inbound calls to local
//! values. The transport hands inbound messages to [`CapTp::dispatch`]
//! and supplies the send function at construction; it must deliver
//! messages in send order.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde_json::Value;
use tracing::{debug, info, warn};

use captp_wire::{CallTarget, CapData, CtpMessage, Slot};

use crate::error::CapTpError;
use crate::marshal;
use crate::promise::{LocalPromise, LocalResolver, Settled, SettleCell};
use crate::remote::Remote;
use crate::table::{RefTables, TableStats};
use crate::value::{CapRef, CapValue, Rejection, Resolution};

/// The bootstrap capability this side offers its peer.
pub enum Bootstrap {
    /// A ready value.
    Value(CapValue),
    /// Evaluated on the first `CTP_BOOTSTRAP`, then cached.
    Thunk(Box<dyn Fn() -> CapValue + Send + Sync>),
}

impl Bootstrap {
    /// A lazily-evaluated bootstrap.
    pub fn thunk(f: impl Fn() -> CapValue + Send + Sync + 'static) -> Self {
        Bootstrap::Thunk(Box::new(f))
    }
}

impl From<CapValue> for Bootstrap {
    fn from(v: CapValue) -> Self {
        Bootstrap::Value(v)
    }
}

/// Mutable per-connection state, all behind one lock. The lock is held
/// only for synchronous sections — never across an await, never across
/// the transport send function.
struct ConnState {
    tables: RefTables,
    /// The abort reason, once the connection is disabled.
    unplugged: Option<Rejection>,
}

pub(crate) struct Inner {
    our_id: String,
    raw_send: Box<dyn Fn(CtpMessage) + Send + Sync>,
    bootstrap: Option<Bootstrap>,
    bootstrap_cache: OnceLock<CapValue>,
    state: Mutex<ConnState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn our_id(&self) -> &str {
        &self.our_id
    }
}

/// A `CTP_CALL` target resolved during the synchronous phase.
enum ResolvedTarget {
    /// One of this side's answers, possibly still in flight.
    Answer(LocalPromise),
    /// A value reached through the import path.
    Value(CapValue),
}

/// One end of a CapTP connection.
///
/// Cheap to clone; all clones share the connection. Created with the
/// transport's send function, torn down by [`abort`](CapTp::abort).
#[derive(Clone)]
pub struct CapTp {
    inner: Arc<Inner>,
}

impl CapTp {
    /// Build an engine around a transport send function.
    ///
    /// `raw_send` must deliver each message to the peer's `dispatch` in
    /// send order and must not block; it is called from entry points and
    /// from settlement tasks. `bootstrap` is the root capability offered
    /// to the peer, if any. The engine spawns delivery and settlement
    /// tasks, so it must be created and driven inside a tokio runtime.
    pub fn new(
        our_id: impl Into<String>,
        raw_send: impl Fn(CtpMessage) + Send + Sync + 'static,
        bootstrap: Option<Bootstrap>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                our_id: our_id.into(),
                raw_send: Box::new(raw_send),
                bootstrap,
                bootstrap_cache: OnceLock::new(),
                state: Mutex::new(ConnState {
                    tables: RefTables::new(),
                    unplugged: None,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// The identity label given at construction.
    pub fn our_id(&self) -> &str {
        &self.inner.our_id
    }

    /// True once the connection has been aborted.
    pub fn is_unplugged(&self) -> bool {
        self.inner.lock().unplugged.is_some()
    }

    /// The abort reason, if the connection has been aborted.
    pub fn unplugged_reason(&self) -> Option<Rejection> {
        self.inner.lock().unplugged.clone()
    }

    /// Sizes of the reference tables.
    pub fn stats(&self) -> TableStats {
        self.inner.lock().tables.stats()
    }

    /// Route one inbound message. Returns `false` without touching any
    /// state once the connection is unplugged.
    pub fn dispatch(&self, msg: CtpMessage) -> bool {
        if self.inner.lock().unplugged.is_some() {
            return false;
        }
        debug!("CapTP[{}]: <- {}", self.inner.our_id, msg.kind());
        match msg {
            CtpMessage::Bootstrap { question_id } => self.handle_bootstrap(question_id),
            CtpMessage::Call {
                question_id,
                target,
                method,
            } => self.handle_call(question_id, target, method),
            CtpMessage::Return {
                answer_id,
                result,
                exception,
            } => self.handle_return(answer_id, result, exception),
            CtpMessage::Resolve {
                promise_id,
                res,
                rej,
            } => self.handle_resolve(promise_id, res, rej),
            CtpMessage::Abort { exception } => self.handle_abort(&exception),
        }
        true
    }

    /// Route an untrusted JSON message. Unrecognized message kinds are
    /// ignored: no state changes, and the return value is `false`.
    pub fn dispatch_json(&self, raw: &Value) -> bool {
        match serde_json::from_value::<CtpMessage>(raw.clone()) {
            Ok(msg) => self.dispatch(msg),
            Err(e) => {
                debug!(
                    "CapTP[{}]: ignoring unrecognized message: {}",
                    self.inner.our_id, e
                );
                false
            }
        }
    }

    /// The peer's bootstrap object, as a pipelined remote. Fails
    /// synchronously with the stored reason once unplugged.
    pub fn get_bootstrap(&self) -> Result<Remote, CapTpError> {
        let (question_id, remote) = {
            let mut st = self.inner.lock();
            if let Some(reason) = &st.unplugged {
                return Err(CapTpError::Unplugged {
                    reason: reason.clone(),
                });
            }
            let question_id = st.tables.next_question_id();
            let cell = SettleCell::new();
            st.tables.questions.insert(question_id, cell.clone());
            let remote = Remote::new(
                Arc::downgrade(&self.inner),
                CallTarget::Question(question_id),
                cell,
            );
            (question_id, remote)
        };
        self.send(CtpMessage::Bootstrap { question_id })?;
        Ok(remote)
    }

    /// Abort the connection, rejecting every pending question and
    /// import. Synthesized as a locally-dispatched `CTP_ABORT`, so a
    /// second call is a no-op: dispatch short-circuits once unplugged.
    pub fn abort(&self, reason: Option<Rejection>) {
        let reason = reason.unwrap_or_else(|| {
            Rejection::message(format!("disconnected from {}", self.inner.our_id))
        });
        self.dispatch(CtpMessage::Abort {
            exception: reason.value().to_plain_json(),
        });
    }

    /// Allocate a question against `target` and send the `CTP_CALL`.
    /// This is the pipelining primitive: it never waits for `target`'s
    /// own settlement.
    pub(crate) fn pipeline(
        &self,
        target: CallTarget,
        prop: &str,
        args: Option<Vec<CapValue>>,
    ) -> Result<Remote, CapTpError> {
        let (question_id, remote, method) = {
            let mut st = self.inner.lock();
            if let Some(reason) = &st.unplugged {
                return Err(CapTpError::Unplugged {
                    reason: reason.clone(),
                });
            }
            let question_id = st.tables.next_question_id();
            let cell = SettleCell::new();
            st.tables.questions.insert(question_id, cell.clone());
            let remote = Remote::new(
                Arc::downgrade(&self.inner),
                CallTarget::Question(question_id),
                cell,
            );
            let mut parts = vec![CapValue::String(prop.to_string())];
            if let Some(args) = args {
                parts.push(CapValue::List(args));
            }
            let method =
                match marshal::serialize(&self.inner, &mut st.tables, &CapValue::List(parts)) {
                    Ok(m) => m,
                    Err(e) => {
                        st.tables.questions.remove(&question_id);
                        return Err(e.into());
                    }
                };
            (question_id, remote, method)
        };
        self.send(CtpMessage::Call {
            question_id,
            target,
            method,
        })?;
        Ok(remote)
    }

    /// Send a message to the peer; fails once unplugged.
    fn send(&self, msg: CtpMessage) -> Result<(), CapTpError> {
        {
            let st = self.inner.lock();
            if let Some(reason) = &st.unplugged {
                return Err(CapTpError::Unplugged {
                    reason: reason.clone(),
                });
            }
        }
        debug!("CapTP[{}]: -> {}", self.inner.our_id, msg.kind());
        (self.inner.raw_send)(msg);
        Ok(())
    }

    fn bootstrap_value(&self) -> CapValue {
        self.inner
            .bootstrap_cache
            .get_or_init(|| match &self.inner.bootstrap {
                Some(Bootstrap::Value(v)) => v.clone(),
                Some(Bootstrap::Thunk(f)) => f(),
                None => CapValue::Null,
            })
            .clone()
    }

    fn handle_bootstrap(&self, question_id: u64) {
        let boot = self.bootstrap_value();
        let msg = {
            let mut st = self.inner.lock();
            st.tables
                .answers
                .insert(question_id, LocalPromise::fulfilled(boot.clone()));
            match marshal::serialize(&self.inner, &mut st.tables, &boot) {
                Ok(result) => CtpMessage::Return {
                    answer_id: question_id,
                    result: Some(result),
                    exception: None,
                },
                Err(e) => {
                    warn!(
                        "CapTP[{}]: bootstrap does not serialize: {}",
                        self.inner.our_id, e
                    );
                    CtpMessage::Return {
                        answer_id: question_id,
                        result: None,
                        exception: Some(marshal::string_capdata(&format!(
                            "unserializable bootstrap: {e}"
                        ))),
                    }
                }
            }
        };
        if let Err(e) = self.send(msg) {
            debug!(
                "CapTP[{}]: dropped bootstrap return: {}",
                self.inner.our_id, e
            );
        }
    }

    fn handle_call(&self, question_id: u64, target: CallTarget, method: CapData) {
        // Synchronous phase: register the answer and resolve the target,
        // so a later pipelined call can chain onto this question before
        // it settles. Failures reject the answer, never the connection.
        let (resolver, prepared) = {
            let mut st = self.inner.lock();
            let (promise, resolver) = LocalPromise::new();
            st.tables.answers.insert(question_id, promise);
            let prepared = prepare_call(&self.inner, &mut st.tables, &target, &method);
            (resolver, prepared)
        };
        match prepared {
            Err(rejection) => self.finish_answer(question_id, &resolver, Err(rejection)),
            Ok((resolved, prop, args)) => {
                let weak = Arc::downgrade(&self.inner);
                tokio::spawn(async move {
                    let outcome = deliver_target(resolved, &prop, args).await;
                    let Some(inner) = weak.upgrade() else { return };
                    CapTp::from_inner(inner).finish_answer(question_id, &resolver, outcome);
                });
            }
        }
    }

    /// Settle an answer and report it to the peer.
    fn finish_answer(&self, question_id: u64, resolver: &LocalResolver, outcome: Resolution) {
        let msg = {
            let mut st = self.inner.lock();
            match outcome {
                Ok(v) => {
                    resolver.fulfill(v.clone());
                    match marshal::serialize(&self.inner, &mut st.tables, &v) {
                        Ok(data) => CtpMessage::Return {
                            answer_id: question_id,
                            result: Some(data),
                            exception: None,
                        },
                        Err(e) => CtpMessage::Return {
                            answer_id: question_id,
                            result: None,
                            exception: Some(marshal::string_capdata(&format!(
                                "unserializable result: {e}"
                            ))),
                        },
                    }
                }
                Err(rejection) => {
                    resolver.reject(rejection.clone());
                    let data = marshal::serialize(&self.inner, &mut st.tables, rejection.value())
                        .unwrap_or_else(|e| {
                            marshal::string_capdata(&format!("unserializable exception: {e}"))
                        });
                    CtpMessage::Return {
                        answer_id: question_id,
                        result: None,
                        exception: Some(data),
                    }
                }
            }
        };
        if let Err(e) = self.send(msg) {
            debug!(
                "CapTP[{}]: dropped return for answer {}: {}",
                self.inner.our_id, question_id, e
            );
        }
    }

    fn handle_return(&self, answer_id: u64, result: Option<CapData>, exception: Option<CapData>) {
        let (cell, settled) = {
            let mut st = self.inner.lock();
            let Some(cell) = st.tables.questions.remove(&answer_id) else {
                warn!(
                    "CapTP[{}]: return for unknown question {}",
                    self.inner.our_id, answer_id
                );
                return;
            };
            // The exception branch wins if both are present.
            let settled = if let Some(exc) = exception {
                match marshal::unserialize(&self.inner, &mut st.tables, &exc) {
                    Ok(v) => Settled::Rejected(Rejection::new(v)),
                    Err(e) => {
                        Settled::Rejected(Rejection::message(format!("undecodable exception: {e}")))
                    }
                }
            } else if let Some(res) = result {
                match marshal::unserialize(&self.inner, &mut st.tables, &res) {
                    Ok(v) => Settled::Fulfilled(v),
                    Err(e) => {
                        Settled::Rejected(Rejection::message(format!("undecodable result: {e}")))
                    }
                }
            } else {
                Settled::Rejected(Rejection::message("malformed return: no result or exception"))
            };
            (cell, settled)
        };
        cell.settle(settled);
    }

    fn handle_resolve(&self, promise_id: u64, res: Option<CapData>, rej: Option<CapData>) {
        let (cell, settled) = {
            let mut st = self.inner.lock();
            let Some(cell) = st.tables.pending_imports.remove(&promise_id) else {
                warn!(
                    "CapTP[{}]: resolve for unknown promise {}",
                    self.inner.our_id, promise_id
                );
                return;
            };
            // The rejection branch wins if both are present.
            let settled = if let Some(rej) = rej {
                match marshal::unserialize(&self.inner, &mut st.tables, &rej) {
                    Ok(v) => Settled::Rejected(Rejection::new(v)),
                    Err(e) => {
                        Settled::Rejected(Rejection::message(format!("undecodable rejection: {e}")))
                    }
                }
            } else if let Some(res) = res {
                match marshal::unserialize(&self.inner, &mut st.tables, &res) {
                    Ok(v) => Settled::Fulfilled(v),
                    Err(e) => {
                        Settled::Rejected(Rejection::message(format!("undecodable resolution: {e}")))
                    }
                }
            } else {
                Settled::Rejected(Rejection::message("malformed resolve: no res or rej"))
            };
            (cell, settled)
        };
        cell.settle(settled);
    }

    fn handle_abort(&self, exception: &Value) {
        let reason = Rejection::new(CapValue::from_plain_json(exception));
        info!("CapTP[{}]: aborted: {}", self.inner.our_id, reason);
        let cells = {
            let mut st = self.inner.lock();
            let mut cells: Vec<Arc<SettleCell>> =
                st.tables.questions.drain().map(|(_, c)| c).collect();
            cells.extend(st.tables.pending_imports.drain().map(|(_, c)| c));
            st.unplugged = Some(reason.clone());
            cells
        };
        for cell in cells {
            cell.reject(reason.clone());
        }
        // Best-effort forward; the peer may already be gone.
        (self.inner.raw_send)(CtpMessage::Abort {
            exception: exception.clone(),
        });
    }

    /// Report an exported promise's settlement via `CTP_RESOLVE`.
    pub(crate) fn send_resolve(&self, promise_id: u64, settled: Settled) {
        let msg = {
            let mut st = self.inner.lock();
            if st.unplugged.is_some() {
                return;
            }
            match settled {
                Settled::Fulfilled(v) => {
                    match marshal::serialize(&self.inner, &mut st.tables, &v) {
                        Ok(data) => CtpMessage::Resolve {
                            promise_id,
                            res: Some(data),
                            rej: None,
                        },
                        Err(e) => CtpMessage::Resolve {
                            promise_id,
                            res: None,
                            rej: Some(marshal::string_capdata(&format!(
                                "unserializable resolution: {e}"
                            ))),
                        },
                    }
                }
                Settled::Rejected(r) => {
                    let data = marshal::serialize(&self.inner, &mut st.tables, r.value())
                        .unwrap_or_else(|e| {
                            marshal::string_capdata(&format!("unserializable rejection: {e}"))
                        });
                    CtpMessage::Resolve {
                        promise_id,
                        res: None,
                        rej: Some(data),
                    }
                }
                Settled::Presence => {
                    warn!(
                        "CapTP[{}]: presence settlement for exported promise {}",
                        self.inner.our_id, promise_id
                    );
                    return;
                }
            }
        };
        if let Err(e) = self.send(msg) {
            debug!(
                "CapTP[{}]: dropped resolve for promise {}: {}",
                self.inner.our_id, promise_id, e
            );
        }
    }
}

/// Decode the method payload and resolve the call target. Runs under
/// the connection lock.
fn prepare_call(
    conn: &Arc<Inner>,
    tables: &mut RefTables,
    target: &CallTarget,
    method: &CapData,
) -> Result<(ResolvedTarget, String, Option<Vec<CapValue>>), Rejection> {
    let method_val = marshal::unserialize(conn, tables, method)
        .map_err(|e| Rejection::message(format!("bad method payload: {e}")))?;
    let (prop, args) = decode_method(method_val)?;
    let resolved = match target {
        CallTarget::Question(id) => ResolvedTarget::Answer(
            tables
                .answers
                .get(id)
                .cloned()
                .ok_or_else(|| Rejection::message(format!("unknown answer {id}")))?,
        ),
        CallTarget::Slot(s) => {
            let slot: Slot = s
                .parse()
                .map_err(|e| Rejection::message(format!("bad call target: {e}")))?;
            let cap = marshal::import_slot(conn, tables, slot)
                .map_err(|e| Rejection::message(format!("bad call target: {e}")))?;
            ResolvedTarget::Value(CapValue::Cap(cap))
        }
    };
    Ok((resolved, prop, args))
}

/// Split a decoded method payload into `[prop]` or `[prop, args]`.
fn decode_method(v: CapValue) -> Result<(String, Option<Vec<CapValue>>), Rejection> {
    let CapValue::List(mut parts) = v else {
        return Err(Rejection::message("malformed method payload"));
    };
    if parts.is_empty() || parts.len() > 2 {
        return Err(Rejection::message("malformed method payload"));
    }
    let args = if parts.len() == 2 {
        match parts.pop() {
            Some(CapValue::List(args)) => Some(args),
            _ => return Err(Rejection::message("malformed method arguments")),
        }
    } else {
        None
    };
    match parts.pop() {
        Some(CapValue::String(prop)) => Ok((prop, args)),
        _ => Err(Rejection::message("malformed method name")),
    }
}

async fn deliver_target(
    target: ResolvedTarget,
    prop: &str,
    args: Option<Vec<CapValue>>,
) -> Resolution {
    let value = match target {
        ResolvedTarget::Answer(p) => p.wait().await?,
        ResolvedTarget::Value(v) => v,
    };
    deliver(value, prop, args).await
}

/// Deliver a property get or method apply to a settled value.
async fn deliver(value: CapValue, prop: &str, args: Option<Vec<CapValue>>) -> Resolution {
    match value {
        CapValue::Cap(CapRef::Object(o)) => match args {
            Some(args) => o.apply(prop, args).await,
            None => o.get(prop).await,
        },
        // A call landing on a remote reference pipelines back out over
        // the wire.
        CapValue::Cap(CapRef::Remote(r)) => {
            let next = match args {
                Some(args) => r.call(prop, args),
                None => r.get(prop),
            }
            .map_err(|e| Rejection::message(e.to_string()))?;
            next.resolution().await
        }
        CapValue::Cap(CapRef::Promise(p)) => {
            let settled = p.wait().await?;
            Box::pin(deliver(settled, prop, args)).await
        }
        CapValue::Record(fields) if args.is_none() => fields
            .get(prop)
            .cloned()
            .ok_or_else(|| Rejection::message(format!("no such property: {prop}"))),
        _ => Err(Rejection::message(if args.is_some() {
            format!("cannot invoke {prop:?} on a non-capability value")
        } else {
            format!("cannot get {prop:?} of a non-capability value")
        })),
    }
}
