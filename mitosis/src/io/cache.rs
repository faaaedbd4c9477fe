//! Process-local task cache in front of the store.
//!
//! Entries are whole-task copies replaced atomically on every write. The
//! cache is bounded by LRU capacity; entries older than the TTL are not
//! served as fresh but stay available as a stale fallback when the store is
//! unreachable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::task::Task;

struct CacheEntry {
    task: Task,
    stored_at: Instant,
    /// Generation of the last use; the key of this entry in `order`.
    used: u64,
}

/// Recency is a generation counter: each use takes the next generation and
/// `order` maps generations back to task ids, oldest first, so a hit or an
/// eviction costs O(log n).
#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    order: BTreeMap<u64, String>,
    generation: u64,
}

impl CacheState {
    fn touch(&mut self, task_id: &str) {
        self.generation += 1;
        let generation = self.generation;
        if let Some(entry) = self.entries.get_mut(task_id) {
            self.order.remove(&entry.used);
            entry.used = generation;
            self.order.insert(generation, task_id.to_string());
        }
    }

    fn remove(&mut self, task_id: &str) {
        if let Some(entry) = self.entries.remove(task_id) {
            self.order.remove(&entry.used);
        }
    }
}

pub struct TaskCache {
    state: Mutex<CacheState>,
    capacity: usize,
    ttl: Duration,
}

impl TaskCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// A copy of the entry if it is younger than the TTL.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        let mut state = self.state.lock().ok()?;
        let fresh = state
            .entries
            .get(task_id)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.task.clone())?;
        state.touch(task_id);
        Some(fresh)
    }

    /// A copy of the entry regardless of age.
    pub fn get_stale(&self, task_id: &str) -> Option<Task> {
        let state = self.state.lock().ok()?;
        state.entries.get(task_id).map(|entry| entry.task.clone())
    }

    /// Replace the entry for this task, evicting the least recently used
    /// entry when full.
    pub fn put(&self, task: &Task) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let task_id = task.task_id.clone();
        state.remove(&task_id);
        state.entries.insert(
            task_id.clone(),
            CacheEntry {
                task: task.clone(),
                stored_at: Instant::now(),
                used: 0,
            },
        );
        state.touch(&task_id);
        while state.entries.len() > self.capacity {
            let Some((_, oldest)) = state.order.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    pub fn invalidate(&self, task_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.remove(task_id);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StepStatus;
    use crate::test_support::{step_with_status, task_with_steps};

    fn task(task_id: &str) -> Task {
        let mut task = task_with_steps(vec![step_with_status("a", StepStatus::Pending)]);
        task.task_id = task_id.to_string();
        task
    }

    #[test]
    fn returns_copies_not_shared_entries() {
        let cache = TaskCache::new(4, Duration::from_secs(60));
        cache.put(&task("t1"));

        let mut copy = cache.get("t1").expect("hit");
        copy.title = "mutated".to_string();

        assert_ne!(cache.get("t1").expect("hit").title, "mutated");
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = TaskCache::new(2, Duration::from_secs(60));
        cache.put(&task("t1"));
        cache.put(&task("t2"));
        cache.get("t1");
        cache.put(&task("t3"));

        assert!(cache.get("t1").is_some());
        assert!(cache.get("t2").is_none());
        assert!(cache.get("t3").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn replacing_an_entry_refreshes_its_recency() {
        let cache = TaskCache::new(2, Duration::from_secs(60));
        cache.put(&task("t1"));
        cache.put(&task("t2"));
        cache.put(&task("t1"));
        cache.put(&task("t3"));

        assert!(cache.get_stale("t1").is_some());
        assert!(cache.get_stale("t2").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_are_only_served_stale() {
        let cache = TaskCache::new(2, Duration::ZERO);
        cache.put(&task("t1"));

        assert!(cache.get("t1").is_none());
        assert!(cache.get_stale("t1").is_some());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = TaskCache::new(2, Duration::from_secs(60));
        cache.put(&task("t1"));
        cache.invalidate("t1");
        assert!(cache.get_stale("t1").is_none());
        assert!(cache.is_empty());
    }
}
