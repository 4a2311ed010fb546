use std::collections::{HashSet, VecDeque};

/// Bounded least-recently-used set of delivered message ids.
#[derive(Debug)]
pub struct DedupSet {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Whether the id was seen; a hit refreshes its recency.
    pub fn check(&mut self, id: &str) -> bool {
        if !self.members.contains(id) {
            return false;
        }
        self.touch(id);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Record a delivered id, evicting the least recently used one when full.
    pub fn insert(&mut self, id: &str) {
        if self.members.contains(id) {
            self.touch(id);
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn touch(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|x| x == id) {
            if let Some(entry) = self.order.remove(pos) {
                self.order.push_back(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_evicts_least_recently_used() {
        let mut set = DedupSet::new(2);
        set.insert("a");
        set.insert("b");
        assert!(set.check("a"));
        set.insert("c");
        assert!(set.contains("a"));
        assert!(!set.contains("b"));
        assert!(set.contains("c"));
        assert_eq!(set.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(ids in proptest::collection::vec(0u16..200, 0..500)) {
            let mut set = DedupSet::new(64);
            for id in ids {
                let id = id.to_string();
                set.insert(&id);
                prop_assert!(set.contains(&id));
                prop_assert!(set.len() <= 64);
            }
        }
    }
}
