//! Integration tests for the CapTP engine.
//!
//! Two engines are wired through in-process tokio channels with pump
//! tasks standing in for the transport, then exercised end-to-end:
//! bootstrap exchange, pipelined calls, capability round trips, promise
//! settlement across the wire, and abort.
//!
//! No sockets are involved — ordered delivery comes from real tokio
//! channels, exactly what the protocol requires of a transport.

use async_trait::async_trait;
use captp_core::{
    Bootstrap, CapObject, CapRef, CapTp, CapTpError, CapValue, LocalPromise, LocalResolver,
    Rejection, Resolution,
};
use captp_wire::CtpMessage;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Harness — two engines joined by in-process channels
// ---------------------------------------------------------------------------

type SendLog = Arc<Mutex<Vec<CtpMessage>>>;

/// Wire two engines A and B so that everything A sends reaches B's
/// dispatch and vice versa. Returns the engines plus a log of A's
/// outbound messages.
fn wire_pair(bootstrap_a: Option<Bootstrap>, bootstrap_b: Option<Bootstrap>) -> (CapTp, CapTp, SendLog) {
    let (tx_ab, mut rx_ab) = mpsc::unbounded_channel();
    let (tx_ba, mut rx_ba) = mpsc::unbounded_channel();

    let a_log: SendLog = Arc::new(Mutex::new(Vec::new()));
    let log = a_log.clone();
    let a = CapTp::new(
        "alice",
        move |msg: CtpMessage| {
            log.lock().unwrap().push(msg.clone());
            let _ = tx_ab.send(msg);
        },
        bootstrap_a,
    );
    let b = CapTp::new(
        "bob",
        move |msg: CtpMessage| {
            let _ = tx_ba.send(msg);
        },
        bootstrap_b,
    );

    let to_b = b.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx_ab.recv().await {
            to_b.dispatch(msg);
        }
    });
    let to_a = a.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx_ba.recv().await {
            to_a.dispatch(msg);
        }
    });

    (a, b, a_log)
}

async fn until<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Host objects
// ---------------------------------------------------------------------------

/// Bootstrap object with arithmetic, an echo, and a version property.
struct Calculator;

#[async_trait]
impl CapObject for Calculator {
    async fn apply(&self, method: &str, mut args: Vec<CapValue>) -> Resolution {
        match method {
            "add" => {
                let (Some(a), Some(b)) = (
                    args.first().and_then(CapValue::as_i64),
                    args.get(1).and_then(CapValue::as_i64),
                ) else {
                    return Err(Rejection::message("add wants two integers"));
                };
                Ok(CapValue::Int(a + b))
            }
            "echo" => Ok(args.pop().unwrap_or(CapValue::Null)),
            "make_adder" => {
                let Some(offset) = args.first().and_then(CapValue::as_i64) else {
                    return Err(Rejection::message("make_adder wants an integer"));
                };
                Ok(CapValue::object(Adder { offset }))
            }
            "fail" => Err(Rejection::message("arithmetic overflow")),
            "never" => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            other => Err(Rejection::message(format!("no such method: {other}"))),
        }
    }

    async fn get(&self, prop: &str) -> Resolution {
        match prop {
            "version" => Ok(CapValue::from("1.0")),
            other => Err(Rejection::message(format!("no such property: {other}"))),
        }
    }
}

struct Adder {
    offset: i64,
}

#[async_trait]
impl CapObject for Adder {
    async fn apply(&self, method: &str, args: Vec<CapValue>) -> Resolution {
        match method {
            "plus" => {
                let Some(x) = args.first().and_then(CapValue::as_i64) else {
                    return Err(Rejection::message("plus wants an integer"));
                };
                Ok(CapValue::Int(self.offset + x))
            }
            other => Err(Rejection::message(format!("no such method: {other}"))),
        }
    }
}

/// A greeter exported from the caller's side, to test that references
/// survive a round trip and that calls forward across hops.
struct Greeter {
    name: &'static str,
}

#[async_trait]
impl CapObject for Greeter {
    async fn apply(&self, method: &str, _args: Vec<CapValue>) -> Resolution {
        match method {
            "greet" => Ok(CapValue::String(format!("hello from {}", self.name))),
            other => Err(Rejection::message(format!("no such method: {other}"))),
        }
    }
}

/// Hands out a promise, settled later through a second call.
struct Deferred {
    resolver: Mutex<Option<LocalResolver>>,
}

#[async_trait]
impl CapObject for Deferred {
    async fn apply(&self, method: &str, mut args: Vec<CapValue>) -> Resolution {
        match method {
            "make" => {
                let (promise, resolver) = LocalPromise::new();
                *self.resolver.lock().unwrap() = Some(resolver);
                Ok(CapValue::Cap(CapRef::Promise(promise)))
            }
            "complete" => {
                let value = args.pop().unwrap_or(CapValue::Null);
                match self.resolver.lock().unwrap().take() {
                    Some(resolver) => {
                        resolver.fulfill(value);
                        Ok(CapValue::Null)
                    }
                    None => Err(Rejection::message("nothing to complete")),
                }
            }
            other => Err(Rejection::message(format!("no such method: {other}"))),
        }
    }
}

fn calculator() -> Option<Bootstrap> {
    Some(Bootstrap::Value(CapValue::object(Calculator)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bootstrap_method_call() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();
    let sum = boot.call("add", vec![CapValue::Int(2), CapValue::Int(3)]).unwrap();
    assert_eq!(sum.resolution().await, Ok(CapValue::Int(5)));
}

#[tokio::test]
async fn test_bootstrap_resolves_to_presence() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();
    let value = boot.resolution().await.unwrap();
    // The settled bootstrap is itself callable.
    let CapValue::Cap(CapRef::Remote(presence)) = value else {
        panic!("bootstrap did not settle to a presence");
    };
    assert!(presence.is_settled());
    let sum = presence
        .call("add", vec![CapValue::Int(20), CapValue::Int(22)])
        .unwrap();
    assert_eq!(sum.resolution().await, Ok(CapValue::Int(42)));
}

#[tokio::test]
async fn test_property_get() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();
    let version = boot.get("version").unwrap();
    assert_eq!(version.resolution().await, Ok(CapValue::from("1.0")));
}

#[tokio::test]
async fn test_pipelined_chain_sends_two_calls_immediately() {
    let (a, _b, a_log) = wire_pair(None, calculator());

    // Issue the whole chain before anything settles.
    let boot = a.get_bootstrap().unwrap();
    let adder = boot.call("make_adder", vec![CapValue::Int(10)]).unwrap();
    let total = adder.call("plus", vec![CapValue::Int(5)]).unwrap();

    // Exactly one bootstrap and two calls are already on the wire.
    {
        let sent = a_log.lock().unwrap();
        let kinds: Vec<_> = sent.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, ["CTP_BOOTSTRAP", "CTP_CALL", "CTP_CALL"]);
    }

    assert_eq!(total.resolution().await, Ok(CapValue::Int(15)));

    // The sequential spelling reaches the same value.
    let adder_value = adder.resolution().await.unwrap();
    let CapValue::Cap(CapRef::Remote(adder_presence)) = adder_value else {
        panic!("make_adder did not settle to a presence");
    };
    let again = adder_presence.call("plus", vec![CapValue::Int(5)]).unwrap();
    assert_eq!(again.resolution().await, Ok(CapValue::Int(15)));
}

#[tokio::test]
async fn test_data_round_trip() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();
    let payload = CapValue::record([
        ("name", CapValue::from("widget")),
        ("mass", CapValue::Float(2.5)),
        (
            "tags",
            CapValue::List(vec![CapValue::from("a"), CapValue::Null, CapValue::Bool(true)]),
        ),
    ]);
    let echoed = boot.call("echo", vec![payload.clone()]).unwrap();
    assert_eq!(echoed.resolution().await, Ok(payload));
}

#[tokio::test]
async fn test_capability_round_trip_restores_identity() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();

    let greeter: Arc<dyn CapObject> = Arc::new(Greeter { name: "alice" });
    let sent = CapValue::Cap(CapRef::Object(greeter));
    let echoed = boot.call("echo", vec![sent.clone()]).unwrap();

    // What comes back is the original local object, not a proxy for it.
    assert_eq!(echoed.resolution().await, Ok(sent));
}

#[tokio::test]
async fn test_call_forwards_through_echoed_reference() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();

    // Bob's answer to `echo` settles to a presence of Alice's greeter,
    // so a call pipelined onto that answer hops back to Alice.
    let greeter = CapValue::object(Greeter { name: "alice" });
    let echoed = boot.call("echo", vec![greeter]).unwrap();
    let greeting = echoed.call("greet", vec![]).unwrap();
    assert_eq!(
        greeting.resolution().await,
        Ok(CapValue::from("hello from alice"))
    );
}

#[tokio::test]
async fn test_promise_settles_across_the_wire() {
    let deferred = Some(Bootstrap::Value(CapValue::object(Deferred {
        resolver: Mutex::new(None),
    })));
    let (a, _b, _log) = wire_pair(None, deferred);
    let boot = a.get_bootstrap().unwrap();

    let future = boot.call("make", vec![]).unwrap();
    let value = future.resolution().await.unwrap();
    let CapValue::Cap(CapRef::Remote(pending)) = value else {
        panic!("make did not return a promise import");
    };
    assert!(!pending.is_settled());

    let done = boot.call("complete", vec![CapValue::Int(42)]).unwrap();
    assert_eq!(done.resolution().await, Ok(CapValue::Null));

    // The CTP_RESOLVE lands and settles the import.
    assert_eq!(pending.resolution().await, Ok(CapValue::Int(42)));
}

#[tokio::test]
async fn test_remote_exception_is_local_rejection() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();

    let failed = boot.call("fail", vec![]).unwrap();
    assert_eq!(
        failed.resolution().await,
        Err(Rejection::message("arithmetic overflow"))
    );

    // A misbehaving method never takes down the connection.
    assert!(!a.is_unplugged());
    let sum = boot.call("add", vec![CapValue::Int(1), CapValue::Int(1)]).unwrap();
    assert_eq!(sum.resolution().await, Ok(CapValue::Int(2)));
}

#[tokio::test]
async fn test_abort_rejects_pending_and_propagates() {
    let (a, b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();
    let hung = boot.call("never", vec![]).unwrap();

    a.abort(Some(Rejection::message("going away")));

    // Every in-flight promise on A rejects with the reason, and nothing
    // new can start.
    assert_eq!(hung.resolution().await, Err(Rejection::message("going away")));
    match a.get_bootstrap() {
        Err(CapTpError::Unplugged { reason }) => {
            assert_eq!(reason, Rejection::message("going away"));
        }
        other => panic!("expected unplugged error, got {other:?}"),
    }
    match boot.call("add", vec![CapValue::Int(1), CapValue::Int(1)]) {
        Err(CapTpError::Unplugged { .. }) => {}
        other => panic!("expected unplugged error, got {other:?}"),
    }

    // The abort reaches the peer.
    until(|| b.is_unplugged(), "peer to unplug").await;
    assert_eq!(
        b.unplugged_reason(),
        Some(Rejection::message("going away"))
    );
}

#[tokio::test]
async fn test_unknown_message_kind_is_ignored() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let before = a.stats();
    assert!(!a.dispatch_json(&serde_json::json!({"type": "CTP_GREET", "hello": 1})));
    assert_eq!(a.stats(), before);
}

#[tokio::test]
async fn test_messages_survive_byte_encoding() {
    // Same exchange, but both legs travel as encoded bytes, the way a
    // real transport would carry them.
    let (tx_ab, mut rx_ab) = mpsc::unbounded_channel::<Vec<u8>>();
    let (tx_ba, mut rx_ba) = mpsc::unbounded_channel::<Vec<u8>>();
    let a = CapTp::new(
        "alice",
        move |msg: CtpMessage| {
            let _ = tx_ab.send(captp_wire::encode_message(&msg).expect("encode"));
        },
        None,
    );
    let b = CapTp::new(
        "bob",
        move |msg: CtpMessage| {
            let _ = tx_ba.send(captp_wire::encode_message(&msg).expect("encode"));
        },
        calculator(),
    );
    let to_b = b.clone();
    tokio::spawn(async move {
        while let Some(bytes) = rx_ab.recv().await {
            to_b.dispatch(captp_wire::decode_message(&bytes).expect("decode"));
        }
    });
    let to_a = a.clone();
    tokio::spawn(async move {
        while let Some(bytes) = rx_ba.recv().await {
            to_a.dispatch(captp_wire::decode_message(&bytes).expect("decode"));
        }
    });

    let boot = a.get_bootstrap().unwrap();
    let sum = boot
        .call("add", vec![CapValue::Int(40), CapValue::Int(2)])
        .unwrap();
    assert_eq!(sum.resolution().await, Ok(CapValue::Int(42)));
}

#[tokio::test]
async fn test_non_finite_float_refuses_to_serialize() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();

    match boot.call("echo", vec![CapValue::Float(f64::NAN)]) {
        Err(CapTpError::Marshal(_)) => {}
        other => panic!("expected marshal error, got {other:?}"),
    }

    // The refused call leaves the connection fully usable.
    let sum = boot.call("add", vec![CapValue::Int(1), CapValue::Int(2)]).unwrap();
    assert_eq!(sum.resolution().await, Ok(CapValue::Int(3)));
}

#[tokio::test]
async fn test_same_capability_exports_once() {
    let (a, _b, _log) = wire_pair(None, calculator());
    let boot = a.get_bootstrap().unwrap();

    let greeter = CapValue::object(Greeter { name: "alice" });
    let first = boot.call("echo", vec![greeter.clone()]).unwrap();
    let second = boot.call("echo", vec![greeter.clone()]).unwrap();
    assert_eq!(first.resolution().await, Ok(greeter.clone()));
    assert_eq!(second.resolution().await, Ok(greeter));

    // One export table entry, not two.
    assert_eq!(a.stats().exported_objects, 1);
}
