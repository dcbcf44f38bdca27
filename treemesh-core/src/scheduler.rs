//! Cooperative timer arena: one-shot and repeating tasks, driven by host-supplied time.
//!
//! Nothing here sleeps. The host calls [`Scheduler::due`] with the current monotonic time
//! (microseconds) and acts on whatever fired.

/// Handle to a scheduled task. Stale handles are harmless: cancel and restart ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

#[derive(Debug)]
struct Entry<T> {
    id: TaskId,
    task: T,
    next_due: u64,
    interval: u64,
    /// None repeats forever.
    remaining: Option<u32>,
}

/// A task that reached its due time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired<T> {
    pub id: TaskId,
    pub task: T,
    /// This was the last iteration; the task is gone.
    pub exhausted: bool,
}

#[derive(Debug)]
pub struct Scheduler<T> {
    entries: Vec<Entry<T>>,
    next_id: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once at `now + delay`.
    pub fn after(&mut self, now: u64, delay: u64, task: T) -> TaskId {
        self.insert(now.saturating_add(delay), delay, Some(1), task)
    }

    /// Run `task` every `interval`, first at `now + interval`. `iterations` of None repeats forever.
    pub fn every(&mut self, now: u64, interval: u64, iterations: Option<u32>, task: T) -> TaskId {
        self.insert(now.saturating_add(interval), interval, iterations, task)
    }

    pub fn cancel(&mut self, id: TaskId) -> Option<T> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos).task)
    }

    /// Push the next due time to `now + interval` without touching the iteration count.
    pub fn restart(&mut self, id: TaskId, now: u64) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(e) => {
                e.next_due = now.saturating_add(e.interval);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn get(&self, id: TaskId) -> Option<&T> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest due time, if any task is pending.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.next_due).min()
    }

    /// Collect every task due at `now`, in due-time order. Each task fires at most once
    /// per call even if several intervals elapsed.
    pub fn due(&mut self, now: u64) -> Vec<Fired<T>> {
        let mut fired: Vec<(u64, Fired<T>)> = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].next_due > now {
                i += 1;
                continue;
            }
            let due_at = self.entries[i].next_due;
            let last = matches!(self.entries[i].remaining, Some(n) if n <= 1);
            if last {
                let e = self.entries.remove(i);
                fired.push((
                    due_at,
                    Fired {
                        id: e.id,
                        task: e.task,
                        exhausted: true,
                    },
                ));
                continue;
            }
            let e = &mut self.entries[i];
            if let Some(n) = e.remaining.as_mut() {
                *n -= 1;
            }
            e.next_due = now.saturating_add(e.interval.max(1));
            fired.push((
                due_at,
                Fired {
                    id: e.id,
                    task: e.task.clone(),
                    exhausted: false,
                },
            ));
            i += 1;
        }
        fired.sort_by_key(|(at, f)| (*at, f.id));
        fired.into_iter().map(|(_, f)| f).collect()
    }

    fn insert(&mut self, due: u64, interval: u64, remaining: Option<u32>, task: T) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            task,
            next_due: due,
            interval,
            remaining,
        });
        id
    }
}
