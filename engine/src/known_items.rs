//! Per-user sets of already-interacted item identifiers.
//!
//! # Thread Safety
//! Two lock levels: a top-level `RwLock` guards the map shape (insert and
//! remove of users) and each per-user set carries its own `Mutex`, so
//! concurrent updates to different users never contend. Lock order is fixed
//! as map lock before entry lock, and neither is ever held across a call
//! into another component.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

type ItemSet = Arc<Mutex<HashSet<String>>>;

#[derive(Default)]
pub struct KnownItems {
    by_user: RwLock<HashMap<String, ItemSet>>,
}

impl KnownItems {
    pub fn new() -> Self {
        Self::default()
    }

    fn item_set(&self, user: &str) -> Option<ItemSet> {
        self.by_user.read().get(user).cloned()
    }

    /// Union `items` into the user's set, creating it if needed. Empty
    /// input is a no-op, so no empty set is ever allocated for an unseen
    /// user. Set creation is double-checked under the write lock so racing
    /// adders share one set.
    pub fn add(&self, user: &str, items: &[String]) {
        if items.is_empty() {
            return;
        }
        let set = match self.item_set(user) {
            Some(set) => set,
            None => {
                let mut by_user = self.by_user.write();
                // Check again: another writer may have created it between
                // the read above and taking the write lock.
                Arc::clone(by_user.entry(user.to_owned()).or_default())
            }
        };
        set.lock().extend(items.iter().cloned());
    }

    /// The user's known items as a defensive copy; empty when the user is
    /// absent or has an empty set (the two are indistinguishable here).
    pub fn get(&self, user: &str) -> HashSet<String> {
        match self.item_set(user) {
            Some(set) => set.lock().clone(),
            None => HashSet::new(),
        }
    }

    /// Item count per user.
    pub fn user_counts(&self) -> HashMap<String, usize> {
        let by_user = self.by_user.read();
        let mut counts = HashMap::with_capacity(by_user.len());
        for (user, items) in by_user.iter() {
            counts.insert(user.clone(), items.lock().len());
        }
        counts
    }

    /// Inverted view: for each item, how many users know it. Each per-user
    /// set is locked only during its own traversal, so concurrent adds to
    /// other users proceed.
    pub fn item_counts(&self) -> HashMap<String, usize> {
        let by_user = self.by_user.read();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for items in by_user.values() {
            for item in items.lock().iter() {
                *counts.entry(item.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Prune in lockstep with a model swap: drop whole entries for users in
    /// neither `keep_users` nor `recent_users`, then prune every surviving
    /// set to items in `keep_items` or `recent_items`.
    pub fn retain(
        &self,
        keep_users: &HashSet<String>,
        keep_items: &HashSet<String>,
        recent_users: &HashSet<String>,
        recent_items: &HashSet<String>,
    ) {
        self.by_user
            .write()
            .retain(|user, _| keep_users.contains(user) || recent_users.contains(user));

        let by_user = self.by_user.read();
        for items in by_user.values() {
            items
                .lock()
                .retain(|item| keep_items.contains(item) || recent_items.contains(item));
        }
    }
}
