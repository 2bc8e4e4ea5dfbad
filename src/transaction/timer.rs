use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// Polled timer wheel.
///
/// Tasks are ordered by `(deadline, id)` so range scans pop everything due
/// in one pass; a side map from id to deadline makes cancellation cheap.
/// All methods take `&self`; the wheel is shared behind an `Arc`.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<(Instant, u64), T>>,
    deadlines: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            deadlines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|t| t.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, deadline: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.insert((deadline, id), value);
        }
        if let Ok(mut deadlines) = self.deadlines.write() {
            deadlines.insert(id, deadline);
        }
        id
    }

    pub fn cancel(&self, id: u64) -> Option<T> {
        let deadline = self.deadlines.write().ok()?.remove(&id)?;
        self.tasks.write().ok()?.remove(&(deadline, id))
    }

    /// Removes and returns every task due at or before `now`.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        let keys: Vec<(Instant, u64)> = {
            let tasks = match self.tasks.read() {
                Ok(tasks) => tasks,
                Err(_) => return due,
            };
            tasks
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect()
        };
        if keys.is_empty() {
            return due;
        }
        due.reserve(keys.len());
        if let Ok(mut tasks) = self.tasks.write() {
            for key in &keys {
                if let Some(value) = tasks.remove(key) {
                    due.push(value);
                }
            }
        }
        if let Ok(mut deadlines) = self.deadlines.write() {
            for (_, id) in keys {
                deadlines.remove(&id);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_poll_cancel() {
        let timer = Timer::new();
        let now = Instant::now();

        let id = timer.timeout_at(now, "due");
        assert_eq!(timer.cancel(id), Some("due"));
        assert_eq!(timer.cancel(id), None);

        timer.timeout_at(now, "first");
        timer.timeout_at(now + Duration::from_millis(10), "second");
        timer.timeout_at(now + Duration::from_secs(60), "far");

        let due = timer.poll(now + Duration::from_millis(20));
        assert_eq!(due, vec!["first", "second"]);
        assert_eq!(timer.len(), 1);

        assert!(timer.poll(now + Duration::from_millis(20)).is_empty());
    }

    #[test]
    fn same_deadline_keeps_insertion_order() {
        let timer = Timer::new();
        let now = Instant::now();
        timer.timeout_at(now, 1);
        timer.timeout_at(now, 2);
        timer.timeout_at(now, 3);
        assert_eq!(timer.poll(now), vec![1, 2, 3]);
    }
}
