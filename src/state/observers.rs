//! Synchronous observer lists
//!
//! Subscribers run in registration order on the posting thread. The list is
//! snapshotted before calling out, so a subscriber may subscribe, unsubscribe
//! or post again without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by [`Observers::subscribe`]
pub type ObserverId = u64;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Observers<T> {
    next_id: AtomicU64,
    list: Mutex<Vec<(ObserverId, Callback<T>)>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            list: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut list) = self.list.lock() {
            list.push((id, Arc::new(callback)));
        }
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        match self.list.lock() {
            Ok(mut list) => {
                let before = list.len();
                list.retain(|(existing, _)| *existing != id);
                list.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = match self.list.lock() {
            Ok(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.list.lock().map(|list| list.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_in_order_and_unsubscribe() {
        let observers = Observers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let first = observers.subscribe(move |v| s1.lock().unwrap().push(("first", *v)));
        let s2 = seen.clone();
        observers.subscribe(move |v| s2.lock().unwrap().push(("second", *v)));

        observers.notify(&1);
        assert!(observers.unsubscribe(first));
        assert!(!observers.unsubscribe(first));
        observers.notify(&2);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 1), ("second", 1), ("second", 2)]
        );
    }
}
