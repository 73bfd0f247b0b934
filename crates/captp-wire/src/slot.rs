//! Connection-scoped slot identifiers.
//!
//! A slot names an exported or imported value within a single CapTP
//! connection. On the wire a slot is a short string: a kind character
//! (`o` for objects, `p` for promises), a direction sign (`+` for the
//! allocating side, `-` for its peer), and a decimal index — `o+3`,
//! `p-17`. Each side only ever allocates `+` slots; the receiver flips
//! the sign on arrival, so the two independently-chosen numbering
//! spaces never collide.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// What a slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// A non-promise capability.
    Object,
    /// A promise for a value.
    Promise,
}

/// Which side of the connection allocated the slot, from the local
/// point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotDir {
    /// Allocated by this side (`+`).
    Export,
    /// Allocated by the peer (`-`).
    Import,
}

/// A parsed slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    /// Object or promise.
    pub kind: SlotKind,
    /// Export or import, relative to this side.
    pub dir: SlotDir,
    /// Index within the allocating side's numbering space. Indices start
    /// at 1 and are never reused within a connection's life.
    pub index: u64,
}

/// Errors from parsing a slot string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotParseError {
    #[error("slot too short: {0:?}")]
    TooShort(String),
    #[error("unknown slot kind {kind:?} in {slot:?}")]
    BadKind { kind: char, slot: String },
    #[error("unknown slot direction {dir:?} in {slot:?}")]
    BadDir { dir: char, slot: String },
    #[error("bad slot index in {slot:?}")]
    BadIndex { slot: String },
}

impl Slot {
    /// An object slot.
    pub fn object(dir: SlotDir, index: u64) -> Self {
        Self {
            kind: SlotKind::Object,
            dir,
            index,
        }
    }

    /// A promise slot.
    pub fn promise(dir: SlotDir, index: u64) -> Self {
        Self {
            kind: SlotKind::Promise,
            dir,
            index,
        }
    }

    /// The same slot as named by the other side of the connection.
    pub fn inverted(self) -> Self {
        let dir = match self.dir {
            SlotDir::Export => SlotDir::Import,
            SlotDir::Import => SlotDir::Export,
        };
        Self { dir, ..self }
    }

    /// True for promise slots.
    pub fn is_promise(self) -> bool {
        self.kind == SlotKind::Promise
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
        };
        let dir = match self.dir {
            SlotDir::Export => '+',
            SlotDir::Import => '-',
        };
        write!(f, "{kind}{dir}{}", self.index)
    }
}

impl FromStr for Slot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let (Some(kind_ch), Some(dir_ch)) = (chars.next(), chars.next()) else {
            return Err(SlotParseError::TooShort(s.to_string()));
        };
        let kind = match kind_ch {
            'o' => SlotKind::Object,
            'p' => SlotKind::Promise,
            other => {
                return Err(SlotParseError::BadKind {
                    kind: other,
                    slot: s.to_string(),
                })
            }
        };
        let dir = match dir_ch {
            '+' => SlotDir::Export,
            '-' => SlotDir::Import,
            other => {
                return Err(SlotParseError::BadDir {
                    dir: other,
                    slot: s.to_string(),
                })
            }
        };
        let index = chars
            .as_str()
            .parse::<u64>()
            .map_err(|_| SlotParseError::BadIndex {
                slot: s.to_string(),
            })?;
        Ok(Slot { kind, dir, index })
    }
}
