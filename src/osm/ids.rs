//! Response-scoped element identifiers

/// Hands out provisional OSM ids: -1, -2, -3, ...
///
/// One allocator per response. Nodes and ways draw from the same counter
/// so no id repeats within a document.
#[derive(Debug)]
pub struct IdAllocator {
    next: i64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: -1 }
    }

    pub fn next_id(&mut self) -> i64 {
        let id = self.next;
        self.next -= 1;
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_decrease() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.next_id(), -1);
        assert_eq!(ids.next_id(), -2);
        assert_eq!(ids.next_id(), -3);
        assert_eq!(ids.next_id(), -4);

        let mut fresh = IdAllocator::default();
        assert_eq!(fresh.next_id(), -1);
    }
}
