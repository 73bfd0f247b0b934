//! Marshalling between value graphs and wire `CapData`.
//!
//! `serialize` walks a value, swapping each capability for an index
//! into the slots list; `unserialize` inverts it. Both directions
//! populate the reference tables as they walk — marshalling is where
//! exports and imports come into existence.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use captp_wire::{CallTarget, CapData, Slot, SlotDir, SlotKind, SlotParseError, QCLASS};

use crate::connection::{CapTp, Inner};
use crate::promise::{Settled, SettleCell};
use crate::remote::Remote;
use crate::table::RefTables;
use crate::value::{CapRef, CapValue};

/// Errors from `serialize`/`unserialize`.
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("non-finite number cannot cross the wire")]
    NonFiniteNumber,
    #[error("record key {0:?} collides with the capability escape")]
    ReservedKey(String),
    #[error("malformed capability escape")]
    BadEscape,
    #[error("slot index {index} out of range ({len} slots)")]
    SlotIndexOutOfRange { index: u64, len: usize },
    #[error("unknown export slot {0}")]
    UnknownExport(Slot),
    #[error("bad slot string: {0}")]
    Slot(#[from] SlotParseError),
    #[error("bad body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Serialize a value, allocating exports for first-seen capabilities.
pub(crate) fn serialize(
    conn: &Arc<Inner>,
    tables: &mut RefTables,
    value: &CapValue,
) -> Result<CapData, MarshalError> {
    let mut slots: Vec<Slot> = Vec::new();
    let body = to_body(conn, tables, &mut slots, value)?;
    Ok(CapData {
        body: serde_json::to_string(&body)?,
        slots: slots.iter().map(|s| s.to_string()).collect(),
    })
}

fn to_body(
    conn: &Arc<Inner>,
    tables: &mut RefTables,
    slots: &mut Vec<Slot>,
    value: &CapValue,
) -> Result<Value, MarshalError> {
    Ok(match value {
        CapValue::Null => Value::Null,
        CapValue::Bool(b) => (*b).into(),
        CapValue::Int(i) => (*i).into(),
        CapValue::Float(f) => serde_json::Number::from_f64(*f)
            .ok_or(MarshalError::NonFiniteNumber)?
            .into(),
        CapValue::String(s) => s.clone().into(),
        CapValue::List(xs) => Value::Array(
            xs.iter()
                .map(|x| to_body(conn, tables, slots, x))
                .collect::<Result<_, _>>()?,
        ),
        CapValue::Record(fields) => {
            let mut out = serde_json::Map::with_capacity(fields.len());
            for (k, v) in fields {
                if k == QCLASS {
                    return Err(MarshalError::ReservedKey(k.clone()));
                }
                out.insert(k.clone(), to_body(conn, tables, slots, v)?);
            }
            Value::Object(out)
        }
        CapValue::Cap(cap) => {
            let slot = export_ref(conn, tables, cap);
            let index = match slots.iter().position(|s| *s == slot) {
                Some(i) => i,
                None => {
                    slots.push(slot);
                    slots.len() - 1
                }
            };
            let mut escape = serde_json::Map::with_capacity(2);
            escape.insert(QCLASS.to_string(), Value::String("slot".to_string()));
            escape.insert("index".to_string(), Value::Number((index as u64).into()));
            Value::Object(escape)
        }
    })
}

/// The slot for a capability, allocating an export on first sight.
/// First-seen promise-like values get a watcher that reports their
/// settlement to the peer exactly once.
fn export_ref(conn: &Arc<Inner>, tables: &mut RefTables, cap: &CapRef) -> Slot {
    if let Some(slot) = tables.slot_of(cap) {
        return slot;
    }
    match cap {
        CapRef::Object(_) => tables.allocate_export(SlotKind::Object, cap.clone()),
        CapRef::Promise(p) => {
            let slot = tables.allocate_export(SlotKind::Promise, cap.clone());
            spawn_resolve_watcher(conn, slot.index, p.cell().clone());
            slot
        }
        // Imported remotes and presences are always already in the
        // tables, so an unseen remote is a question: export it as a
        // fresh promise.
        CapRef::Remote(r) => {
            let slot = tables.allocate_export(SlotKind::Promise, cap.clone());
            spawn_resolve_watcher(conn, slot.index, r.cell.clone());
            slot
        }
    }
}

/// Report a promise's settlement to the peer via `CTP_RESOLVE`, once.
fn spawn_resolve_watcher(conn: &Arc<Inner>, promise_id: u64, cell: Arc<SettleCell>) {
    let weak = Arc::downgrade(conn);
    tokio::spawn(async move {
        let settled = cell.wait().await;
        let Some(inner) = weak.upgrade() else { return };
        CapTp::from_inner(inner).send_resolve(promise_id, settled);
    });
}

/// Unserialize wire data, importing first-seen slots.
pub(crate) fn unserialize(
    conn: &Arc<Inner>,
    tables: &mut RefTables,
    data: &CapData,
) -> Result<CapValue, MarshalError> {
    let body: Value = serde_json::from_str(&data.body)?;
    let slots = data
        .slots
        .iter()
        .map(|s| s.parse::<Slot>())
        .collect::<Result<Vec<_>, _>>()?;
    from_body(conn, tables, &slots, &body)
}

fn from_body(
    conn: &Arc<Inner>,
    tables: &mut RefTables,
    slots: &[Slot],
    v: &Value,
) -> Result<CapValue, MarshalError> {
    Ok(match v {
        Value::Object(m) if m.contains_key(QCLASS) => {
            if m.get(QCLASS).and_then(Value::as_str) != Some("slot") {
                return Err(MarshalError::BadEscape);
            }
            let index = m
                .get("index")
                .and_then(Value::as_u64)
                .ok_or(MarshalError::BadEscape)?;
            let their_slot = *slots.get(index as usize).ok_or(
                MarshalError::SlotIndexOutOfRange {
                    index,
                    len: slots.len(),
                },
            )?;
            CapValue::Cap(import_slot(conn, tables, their_slot)?)
        }
        Value::Object(m) => CapValue::Record(
            m.iter()
                .map(|(k, v)| Ok((k.clone(), from_body(conn, tables, slots, v)?)))
                .collect::<Result<_, MarshalError>>()?,
        ),
        Value::Array(xs) => CapValue::List(
            xs.iter()
                .map(|x| from_body(conn, tables, slots, x))
                .collect::<Result<_, _>>()?,
        ),
        Value::Null => CapValue::Null,
        Value::Bool(b) => CapValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => CapValue::Int(i),
            None => CapValue::Float(n.as_f64().ok_or(MarshalError::NonFiniteNumber)?),
        },
        Value::String(s) => CapValue::String(s.clone()),
    })
}

/// The local capability for a slot named by the peer.
///
/// Inverts the direction to the local-facing name. Unseen peer-owned
/// slots become fresh remotes: object slots settle immediately as
/// presences, promise slots wait in the pending-imports table for a
/// `CTP_RESOLVE`. A peer reference to an export this side never
/// allocated is an error.
pub(crate) fn import_slot(
    conn: &Arc<Inner>,
    tables: &mut RefTables,
    their_slot: Slot,
) -> Result<CapRef, MarshalError> {
    let slot = their_slot.inverted();
    if let Some(cap) = tables.lookup(slot) {
        return Ok(cap);
    }
    if slot.dir == SlotDir::Export {
        return Err(MarshalError::UnknownExport(slot));
    }
    let cell = SettleCell::new();
    let remote = Remote::new(
        Arc::downgrade(conn),
        CallTarget::Slot(slot.to_string()),
        cell,
    );
    if slot.is_promise() {
        tables.pending_imports.insert(slot.index, remote.cell.clone());
    } else {
        remote.cell.settle(Settled::Presence);
        debug!("CapTP[{}]: new presence {}", conn.our_id(), slot);
    }
    let cap = CapRef::Remote(remote);
    tables.record_import(slot, cap.clone());
    Ok(cap)
}

/// `CapData` carrying just a message string, for when a real value
/// cannot be serialized.
pub(crate) fn string_capdata(msg: &str) -> CapData {
    CapData {
        body: Value::String(msg.to_string()).to_string(),
        slots: Vec::new(),
    }
}
