use std::collections::{HashMap, HashSet, VecDeque};

pub const DEFAULT_MAX_TRACKED_SESSIONS: usize = 1000;
pub const DEFAULT_EVICTION_BATCH: usize = 100;

/// Remembers which goals already fired for a session so a goal is credited
/// at most once per session for the lifetime of the process.
///
/// Memory is bounded by evicting the oldest sessions (insertion order, not
/// recency) once more than `max_sessions` are tracked.
pub struct SessionConversionTracker {
    max_sessions: usize,
    eviction_batch: usize,
    converted: HashMap<(String, String), HashSet<String>>,
    insertion_order: VecDeque<(String, String)>,
}

impl Default for SessionConversionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACKED_SESSIONS, DEFAULT_EVICTION_BATCH)
    }
}

impl SessionConversionTracker {
    pub fn new(max_sessions: usize, eviction_batch: usize) -> Self {
        Self {
            max_sessions,
            eviction_batch: eviction_batch.max(1),
            converted: HashMap::new(),
            insertion_order: VecDeque::new(),
        }
    }

    pub fn has_converted(&self, site_id: &str, session_id: &str, goal_id: &str) -> bool {
        self.converted
            .get(&(site_id.to_string(), session_id.to_string()))
            .is_some_and(|goals| goals.contains(goal_id))
    }

    /// Record a conversion. Returns `false` when the goal had already been
    /// credited to this session.
    pub fn mark_converted(&mut self, site_id: &str, session_id: &str, goal_id: &str) -> bool {
        let key = (site_id.to_string(), session_id.to_string());
        if !self.converted.contains_key(&key) {
            self.insertion_order.push_back(key.clone());
        }
        let inserted = self
            .converted
            .entry(key)
            .or_default()
            .insert(goal_id.to_string());

        if self.converted.len() > self.max_sessions {
            self.evict_oldest();
        }
        inserted
    }

    pub fn converted_goals(&self, site_id: &str, session_id: &str) -> HashSet<String> {
        self.converted
            .get(&(site_id.to_string(), session_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn tracked_sessions(&self) -> usize {
        self.converted.len()
    }

    pub fn clear(&mut self) {
        self.converted.clear();
        self.insertion_order.clear();
    }

    fn evict_oldest(&mut self) {
        for _ in 0..self.eviction_batch {
            let Some(key) = self.insertion_order.pop_front() else {
                break;
            };
            self.converted.remove(&key);
        }
    }
}
