use std::ops::Index;

/// Insertion-ordered set with stable indices.
///
/// Lookups are linear, which keeps equality the only requirement on `T`
/// (constant pools compare floats by bit pattern and never hash them).
pub struct OrderedSet<T: PartialEq> {
    items: Vec<T>,
}

impl<T: PartialEq> Default for OrderedSet<T> {
    fn default() -> Self {
        Self { items: vec![] }
    }
}

impl<T: PartialEq> OrderedSet<T> {
    pub fn find(&self, value: &T) -> Option<u32> {
        self.items
            .iter()
            .position(|elem| elem == value)
            .map(|idx| idx as u32)
    }

    /// Returns the index of `value`, appending it when absent. Fails with the
    /// current length when appending would exceed `limit` entries.
    pub fn insert(&mut self, value: T, limit: usize) -> Result<u32, usize> {
        if let Some(index) = self.find(&value) {
            return Ok(index);
        }

        if self.items.len() >= limit {
            return Err(self.items.len());
        }

        self.items.push(value);
        Ok((self.items.len() - 1) as u32)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T: PartialEq> Index<usize> for OrderedSet<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.items[index]
    }
}

#[cfg(test)]
mod tests {
    use super::OrderedSet;

    #[test]
    fn test_insert_dedup() {
        let mut set = OrderedSet::default();

        assert_eq!(set.insert("a", 8), Ok(0));
        assert_eq!(set.insert("b", 8), Ok(1));
        assert_eq!(set.insert("a", 8), Ok(0));
        assert_eq!(set.len(), 2);
        assert_eq!(set[1], "b");
    }

    #[test]
    fn test_insert_limit() {
        let mut set = OrderedSet::default();

        assert_eq!(set.insert(1, 1), Ok(0));
        assert_eq!(set.insert(1, 1), Ok(0));
        assert_eq!(set.insert(2, 1), Err(1));
    }
}
