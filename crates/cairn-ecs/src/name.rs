//! Interned names keyed by a stable 64-bit hash.
//!
//! The hash is the first eight bytes of the string's blake3 digest, so the
//! same text maps to the same [`Name`] in every process. Collisions are
//! resolved by linear probing: a colliding string takes the next free slot.

use std::collections::HashMap;
use std::fmt;

/// Handle to a string interned in a [`NameDictionary`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(u64);

impl Name {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({:016x})", self.0)
    }
}

/// Stable hash used as the initial slot of `text`.
pub fn name_hash(text: &str) -> u64 {
    let digest = blake3::hash(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Process-wide table of interned names.
pub struct NameDictionary {
    entries: HashMap<u64, String>,
    hasher: fn(&str) -> u64,
}

impl Default for NameDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NameDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameDictionary")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl NameDictionary {
    pub fn new() -> Self {
        Self::with_hasher(name_hash)
    }

    /// Dictionary with a custom slot hash.
    pub fn with_hasher(hasher: fn(&str) -> u64) -> Self {
        Self {
            entries: HashMap::new(),
            hasher,
        }
    }

    /// Intern `text`, returning the existing name if it is already present.
    pub fn make_name(&mut self, text: &str) -> Name {
        let mut slot = (self.hasher)(text);
        loop {
            match self.entries.get(&slot) {
                Some(existing) if existing == text => return Name(slot),
                Some(existing) => {
                    tracing::debug!(name = text, colliding = %existing, slot, "name hash collision; probing");
                    slot = slot.wrapping_add(1);
                }
                None => {
                    self.entries.insert(slot, text.to_owned());
                    return Name(slot);
                }
            }
        }
    }

    /// Look up an interned string without inserting it.
    pub fn find_name(&self, text: &str) -> Option<Name> {
        let mut slot = (self.hasher)(text);
        loop {
            match self.entries.get(&slot) {
                Some(existing) if existing == text => return Some(Name(slot)),
                Some(_) => slot = slot.wrapping_add(1),
                None => return None,
            }
        }
    }

    pub fn resolve(&self, name: Name) -> Option<&str> {
        self.entries.get(&name.0).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
