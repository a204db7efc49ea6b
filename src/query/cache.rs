// query/cache.rs - Bounded cache for ad-hoc query results
//
// Keyed by the canonical query JSON. Bounded both by distinct shapes and by
// total cached rows; eviction is oldest-insertion-first. Any change batch
// invalidates everything, so a hit can only serve state no write has
// touched since.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Vec<Value>>,
    order: VecDeque<String>,
    total_rows: usize,
}

pub struct QueryCache {
    max_queries: usize,
    max_rows: usize,
    state: Mutex<CacheState>,
}

impl QueryCache {
    pub fn new(max_queries: usize, max_rows: usize) -> Self {
        Self {
            max_queries,
            max_rows,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<Value>> {
        let state = self.state.lock().await;
        state.entries.get(key).cloned()
    }

    pub async fn put(&self, key: String, rows: Vec<Value>) {
        if self.max_queries == 0 || rows.len() > self.max_rows {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(old) = state.entries.insert(key.clone(), rows.clone()) {
            state.total_rows -= old.len();
            state.order.retain(|k| k != &key);
        }
        state.total_rows += rows.len();
        state.order.push_back(key);

        while state.order.len() > self.max_queries || state.total_rows > self.max_rows {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            if let Some(rows) = state.entries.remove(&oldest) {
                state.total_rows -= rows.len();
            }
        }
    }

    pub async fn invalidate_all(&self) {
        let mut state = self.state.lock().await;
        *state = CacheState::default();
    }
}
