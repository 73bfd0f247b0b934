//! Per-connection reference tables.
//!
//! The slot scheme runs on four tables. Exports this side allocates
//! live in dense arenas whose length doubles as the id counter, so ids
//! are monotonic and never reused. Slots the peer allocated arrive
//! sparsely and are cached in a map. An identity-keyed index from
//! capability to slot completes the bijection in the other direction.

use std::collections::HashMap;
use std::sync::Arc;

use captp_wire::{Slot, SlotDir, SlotKind};

use crate::promise::{LocalPromise, SettleCell};
use crate::value::CapRef;

pub(crate) struct RefTables {
    exported_objects: Vec<CapRef>,
    exported_promises: Vec<CapRef>,
    imported: HashMap<Slot, CapRef>,
    by_identity: HashMap<usize, Slot>,
    /// Calls this side issued, by question id, until their `CTP_RETURN`.
    pub questions: HashMap<u64, Arc<SettleCell>>,
    /// Calls the peer issued, by the peer's question id. Never retired:
    /// a late pipelined call may still target one.
    pub answers: HashMap<u64, LocalPromise>,
    /// Imported promises awaiting `CTP_RESOLVE`, by numeric id.
    pub pending_imports: HashMap<u64, Arc<SettleCell>>,
    last_question_id: u64,
}

impl RefTables {
    pub fn new() -> Self {
        Self {
            exported_objects: Vec::new(),
            exported_promises: Vec::new(),
            imported: HashMap::new(),
            by_identity: HashMap::new(),
            questions: HashMap::new(),
            answers: HashMap::new(),
            pending_imports: HashMap::new(),
            last_question_id: 0,
        }
    }

    /// The slot already allocated for a capability, if any.
    pub fn slot_of(&self, cap: &CapRef) -> Option<Slot> {
        self.by_identity.get(&cap.identity()).copied()
    }

    /// Allocate the next export slot of `kind` and record the bijection.
    /// Indices start at 1.
    pub fn allocate_export(&mut self, kind: SlotKind, cap: CapRef) -> Slot {
        let arena = match kind {
            SlotKind::Object => &mut self.exported_objects,
            SlotKind::Promise => &mut self.exported_promises,
        };
        arena.push(cap.clone());
        let slot = Slot {
            kind,
            dir: SlotDir::Export,
            index: arena.len() as u64,
        };
        self.by_identity.insert(cap.identity(), slot);
        slot
    }

    /// Cache a peer-allocated slot and its local representation.
    pub fn record_import(&mut self, slot: Slot, cap: CapRef) {
        debug_assert_eq!(slot.dir, SlotDir::Import);
        self.by_identity.insert(cap.identity(), slot);
        self.imported.insert(slot, cap);
    }

    /// The capability a local-facing slot names, if known.
    pub fn lookup(&self, slot: Slot) -> Option<CapRef> {
        match slot.dir {
            SlotDir::Export => {
                let arena = match slot.kind {
                    SlotKind::Object => &self.exported_objects,
                    SlotKind::Promise => &self.exported_promises,
                };
                let index = slot.index.checked_sub(1)? as usize;
                arena.get(index).cloned()
            }
            SlotDir::Import => self.imported.get(&slot).cloned(),
        }
    }

    /// Allocate a question id.
    pub fn next_question_id(&mut self) -> u64 {
        self.last_question_id += 1;
        self.last_question_id
    }

    /// Current table sizes.
    pub fn stats(&self) -> TableStats {
        TableStats {
            exported_objects: self.exported_objects.len(),
            exported_promises: self.exported_promises.len(),
            imports: self.imported.len(),
            questions: self.questions.len(),
            answers: self.answers.len(),
            pending_imports: self.pending_imports.len(),
        }
    }
}

/// Sizes of a connection's reference tables.
///
/// The reference protocol has no release messages, so the export and
/// import counts only grow over a connection's life; this is the
/// observable measure of that growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Objects this side has exported.
    pub exported_objects: usize,
    /// Promises this side has exported.
    pub exported_promises: usize,
    /// Peer-allocated slots seen so far.
    pub imports: usize,
    /// Questions awaiting a return.
    pub questions: usize,
    /// Answers computed or in flight for the peer.
    pub answers: usize,
    /// Imported promises awaiting resolution.
    pub pending_imports: usize,
}
