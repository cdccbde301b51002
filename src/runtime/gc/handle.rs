use std::fmt::Display;

/// Generation-checked reference into the collector's arena.
///
/// A handle outlives the object it names only as a dangling index: the slot's
/// generation moves on when the object is swept, so resolving a stale handle
/// fails instead of aliasing whatever took the slot next.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(super) index: u32,
    pub(super) generation: u32,
}

impl Handle {
    pub(super) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Identity hash used as the default object hash.
    pub fn identity_hash(&self) -> u64 {
        ((self.generation as u64) << 32 | self.index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.index, self.generation)
    }
}
