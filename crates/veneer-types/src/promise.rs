//! Behavioral promises attached to a call site at creation time.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// An immutable bitmask of caller-declared guarantees about a call site.
///
/// Promises license faster but less defensive invocation strategies; they
/// are never verified at runtime. Violating one is documented undefined
/// behavior, except a callback arriving under [`Promises::NO_CALLBACKS`],
/// which raises an unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Promises(u32);

impl Promises {
    /// No promises; the engine stays on the defensive path.
    pub const NONE: Promises = Promises(0);

    /// The native function neither returns nor retains pointers into
    /// managed memory. Licenses the JIT fast path and frame-local
    /// temporary keeping instead of the shared pin table.
    pub const NO_MANAGED_RETURN: Promises = Promises(1 << 0);

    /// The native function never calls back into managed code. Skips the
    /// reentrancy guard around the call.
    pub const NO_CALLBACKS: Promises = Promises(1 << 1);

    /// The native function does not block. A scheduling hint only; no
    /// invocation behavior depends on it.
    pub const NO_BLOCKING: Promises = Promises(1 << 2);

    pub fn contains(self, other: Promises) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Promises {
    type Output = Promises;

    fn bitor(self, rhs: Promises) -> Promises {
        Promises(self.0 | rhs.0)
    }
}

impl BitOrAssign for Promises {
    fn bitor_assign(&mut self, rhs: Promises) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Promises {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "none");
        }
        let mut first = true;
        for (bit, name) in [
            (Promises::NO_MANAGED_RETURN, "no-managed-return"),
            (Promises::NO_CALLBACKS, "no-callbacks"),
            (Promises::NO_BLOCKING, "no-blocking"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}
