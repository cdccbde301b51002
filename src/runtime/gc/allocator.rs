use std::{cell::Cell, rc::Rc};

/// What an allocation is for; passed through to the allocator for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocTag {
    Object,
    String,
    Stack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("allocation of {requested} bytes refused")]
pub struct AllocError {
    pub requested: usize,
}

/// The single memory gate of the runtime.
///
/// Follows the realloc contract: `old_size == 0` allocates, `new_size == 0`
/// frees, anything else resizes. Backing storage itself lives in Rust
/// collections; the allocator decides whether a request may proceed and keeps
/// the books.
pub trait Allocator {
    fn reallocate(
        &mut self,
        old_size: usize,
        new_size: usize,
        tag: AllocTag,
    ) -> Result<(), AllocError>;

    fn in_use(&self) -> usize;
}

#[derive(Default)]
pub struct SystemAllocator {
    in_use: usize,
}

impl Allocator for SystemAllocator {
    fn reallocate(
        &mut self,
        old_size: usize,
        new_size: usize,
        _tag: AllocTag,
    ) -> Result<(), AllocError> {
        self.in_use = self.in_use.saturating_sub(old_size) + new_size;
        Ok(())
    }

    fn in_use(&self) -> usize {
        self.in_use
    }
}

/// Refuses any request that would push usage past `limit` bytes. The shared
/// counter lets callers observe usage after handing the allocator over.
pub struct LimitedAllocator {
    limit: usize,
    in_use: Rc<Cell<usize>>,
}

impl LimitedAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: Rc::default(),
        }
    }

    pub fn usage(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.in_use)
    }
}

impl Allocator for LimitedAllocator {
    fn reallocate(
        &mut self,
        old_size: usize,
        new_size: usize,
        _tag: AllocTag,
    ) -> Result<(), AllocError> {
        let next = self.in_use.get().saturating_sub(old_size) + new_size;

        if new_size > old_size && next > self.limit {
            return Err(AllocError {
                requested: new_size,
            });
        }

        self.in_use.set(next);
        Ok(())
    }

    fn in_use(&self) -> usize {
        self.in_use.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limited_allocator() {
        let mut alloc = LimitedAllocator::new(100);
        let usage = alloc.usage();

        assert!(alloc.reallocate(0, 60, AllocTag::Object).is_ok());
        assert!(alloc.reallocate(0, 60, AllocTag::Object).is_err());
        assert!(alloc.reallocate(60, 0, AllocTag::Object).is_ok());
        assert_eq!(usage.get(), 0);
    }
}
