//! Pin arena for call-scoped native temporaries.
//!
//! Storage handed to foreign code by address must not move or drop while
//! the call (and any reentrant callback) can still touch it. The arena
//! owns such temporaries and hands out [`PinToken`]s; a token release is
//! generation-checked, so a stale token held past its release cannot free
//! a slot that has since been reused.
//!
//! [`PinScope`] is the per-call view: it pins temporaries during frame
//! construction and releases them all when the call scope ends, errors
//! included.

use std::ffi::CString;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

static PINS: Lazy<PinTable> = Lazy::new(PinTable::new);

/// The process-wide arena.
pub fn pins() -> &'static PinTable {
    &PINS
}

/// Owned storage kept alive for the duration of a pin.
#[derive(Debug)]
pub enum PinData {
    Bytes(Box<[u8]>),
    CString(CString),
}

impl PinData {
    /// Stable address of the owned storage. Entries may move inside the
    /// arena's slot vector; the heap allocations they point to do not.
    fn addr(&self) -> usize {
        match self {
            PinData::Bytes(bytes) => bytes.as_ptr() as usize,
            PinData::CString(s) => s.as_ptr() as usize,
        }
    }
}

/// Proof of a pinned slot. Valid until released once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinToken {
    index: u32,
    generation: u32,
}

struct Slots {
    entries: Vec<Option<PinData>>,
    /// Parallel to `entries`; bumped on every release so stale tokens
    /// miss.
    generations: Vec<u32>,
    free: Vec<u32>,
    live: usize,
}

pub struct PinTable {
    slots: Mutex<Slots>,
}

impl PinTable {
    fn new() -> PinTable {
        PinTable {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                generations: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Pins `data`, returning the release token and the pinned address.
    pub fn pin(&self, data: PinData) -> (PinToken, usize) {
        let addr = data.addr();
        let mut slots = self.slots.lock();
        let index = match slots.free.pop() {
            Some(index) => {
                slots.entries[index as usize] = Some(data);
                index
            }
            None => {
                slots.entries.push(Some(data));
                slots.generations.push(0);
                (slots.entries.len() - 1) as u32
            }
        };
        slots.live += 1;
        let generation = slots.generations[index as usize];
        (PinToken { index, generation }, addr)
    }

    /// Releases a pinned slot. Returns `false` for stale or already
    /// released tokens without touching the current occupant.
    pub fn release(&self, token: PinToken) -> bool {
        let mut slots = self.slots.lock();
        let index = token.index as usize;
        if index >= slots.entries.len()
            || slots.generations[index] != token.generation
            || slots.entries[index].is_none()
        {
            return false;
        }
        slots.entries[index] = None;
        slots.generations[index] = slots.generations[index].wrapping_add(1);
        slots.free.push(token.index);
        slots.live -= 1;
        true
    }

    /// Number of live pins across all threads.
    pub fn outstanding(&self) -> usize {
        self.slots.lock().live
    }
}

/// Pins taken for one call, released together when the scope drops.
pub struct PinScope {
    tokens: Vec<PinToken>,
}

impl PinScope {
    pub fn new() -> PinScope {
        PinScope { tokens: Vec::new() }
    }

    /// Pins `data` into the arena for the lifetime of this scope and
    /// returns the pinned address.
    pub fn pin(&mut self, data: PinData) -> usize {
        let (token, addr) = pins().pin(data);
        self.tokens.push(token);
        addr
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for PinScope {
    fn default() -> Self {
        PinScope::new()
    }
}

impl Drop for PinScope {
    fn drop(&mut self) {
        for token in self.tokens.drain(..) {
            pins().release(token);
        }
    }
}

/// Serializes tests that assert global arena counts; anything that pins
/// through [`pins`] while such a test runs would skew them.
#[cfg(test)]
pub(crate) static ARENA_TEST_LOCK: Mutex<()> = Mutex::new(());
