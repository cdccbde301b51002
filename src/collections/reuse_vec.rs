/// A stack whose popped entries stay allocated so the next push at the same
/// depth can recycle them instead of building a fresh value.
pub struct ReuseVec<T> {
    data: Vec<T>,
    len: usize,
}

impl<T> Default for ReuseVec<T> {
    fn default() -> Self {
        Self {
            data: vec![],
            len: 0,
        }
    }
}

impl<T> ReuseVec<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of entries that are allocated, live or not.
    pub fn allocated(&self) -> usize {
        self.data.len()
    }

    /// Makes the next entry live. Recycles a previously popped entry when one
    /// exists at this depth, otherwise builds one with `init`.
    pub fn push_with(&mut self, init: impl FnOnce() -> T) -> &mut T {
        if self.data.len() == self.len {
            self.data.push(init());
        }

        self.len += 1;
        &mut self.data[self.len - 1]
    }

    pub fn pop(&mut self) -> Option<&mut T> {
        if self.len == 0 {
            return None;
        }

        self.len -= 1;
        self.data.get_mut(self.len)
    }

    /// Drops liveness of every entry at `len` and above; storage is kept.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        if idx < self.len {
            self.data.get(idx)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        if idx < self.len {
            self.data.get_mut(idx)
        } else {
            None
        }
    }

    pub fn last(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|idx| self.data.get(idx))
    }

    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.len.checked_sub(1).and_then(|idx| self.data.get_mut(idx))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.data[..self.len].iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.data[..self.len].iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::ReuseVec;

    #[test]
    fn test_reuse_vec() {
        let mut vec = ReuseVec::default();

        vec.push_with(|| 1);
        vec.push_with(|| 2);
        vec.push_with(|| 3);

        assert_eq!(vec.pop(), Some(&mut 3));
        assert_eq!(vec.len(), 2);
        assert_eq!(vec.allocated(), 3);

        // the popped entry is recycled instead of re-initialized
        assert_eq!(*vec.push_with(|| 100), 3);
        assert_eq!(vec.allocated(), 3);

        assert_eq!(vec.pop(), Some(&mut 3));
        assert_eq!(vec.pop(), Some(&mut 2));
        assert_eq!(vec.pop(), Some(&mut 1));
        assert_eq!(vec.pop(), None);
        assert!(vec.is_empty());
    }
}
