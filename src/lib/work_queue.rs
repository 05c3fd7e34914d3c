//! Bounded blocking work queues for pipeline flow control.
//!
//! Every pipeline node owns one inbound [`WorkQueue`] of messages. The queue
//! is a multi-producer/multi-consumer FIFO with a fixed capacity: `push`
//! blocks when the queue is full, which is how back-pressure propagates from
//! a slow downstream stage all the way to the data loader.
//!
//! A queue can be terminated: after [`WorkQueue::terminate`], pushes fail
//! with [`PushError::Terminated`] while pops drain the remaining items and
//! then report [`PopResult::Terminated`]. [`WorkQueue::restart`] re-opens a
//! fully drained queue so the owning node can be run again.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Instant;

/// Error returned by [`WorkQueue::push`] on a terminated queue.
///
/// Carries the rejected item back to the caller so it is never silently lost.
#[derive(Debug)]
pub struct PushError<T>(pub T);

/// Outcome of a deadline-bounded pop.
#[derive(Debug)]
pub enum PopResult<T> {
    /// An item was dequeued.
    Item(T),
    /// The deadline elapsed with the queue still empty.
    TimedOut,
    /// The queue is terminated and fully drained.
    Terminated,
}

struct QueueState<T> {
    items: VecDeque<T>,
    terminated: bool,
}

/// A bounded, blocking, terminatable MPMC FIFO.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "work queue capacity must be non-zero");
        Self {
            state: Mutex::new(QueueState { items: VecDeque::with_capacity(capacity), terminated: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an item, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`PushError`] carrying the item if the queue has been
    /// terminated (either before the call or while blocked waiting for
    /// space).
    pub fn push(&self, item: T) -> std::result::Result<(), PushError<T>> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.terminated {
            self.not_full.wait(&mut state);
        }
        if state.terminated {
            return Err(PushError(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue an item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is terminated and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.terminated {
            self.not_empty.wait(&mut state);
        }
        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Dequeue an item without blocking; `None` when the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Dequeue an item, giving up at `deadline`.
    ///
    /// Termination still drains: items queued before termination are
    /// returned before [`PopResult::Terminated`] is reported.
    pub fn pop_with_deadline(&self, deadline: Instant) -> PopResult<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return PopResult::Item(item);
            }
            if state.terminated {
                return PopResult::Terminated;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                // One last look: the notifier may have raced the timeout.
                return match state.items.pop_front() {
                    Some(item) => {
                        drop(state);
                        self.not_full.notify_one();
                        PopResult::Item(item)
                    }
                    None if state.terminated => PopResult::Terminated,
                    None => PopResult::TimedOut,
                };
            }
        }
    }

    /// Mark the queue terminated.
    ///
    /// Subsequent pushes fail; pops drain the backlog and then observe
    /// termination. Idempotent.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Re-open a terminated queue for another run.
    ///
    /// Only legal after every consumer has observed termination and joined;
    /// the backlog must be empty by then.
    pub fn restart(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.items.is_empty(), "restarting a non-empty work queue");
        state.terminated = false;
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// The fixed capacity this queue was created with.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
    }

    #[test]
    fn test_push_blocks_until_pop() {
        let queue = Arc::new(WorkQueue::new(2));
        queue.push(1u32).unwrap();
        queue.push(2).unwrap();

        let q = Arc::clone(&queue);
        let pusher = thread::spawn(move || {
            // Blocks until the main thread pops.
            q.push(3).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(1));
        pusher.join().unwrap();
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_terminate_drains_then_ends() {
        let queue = WorkQueue::new(8);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        queue.terminate();

        assert!(queue.push("c").is_err());
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_terminate_wakes_blocked_consumer() {
        let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(4));
        let q = Arc::clone(&queue);
        let consumer = thread::spawn(move || q.pop());
        thread::sleep(Duration::from_millis(20));
        queue.terminate();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_terminate_wakes_blocked_producer() {
        let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(1));
        queue.push(0).unwrap();
        let q = Arc::clone(&queue);
        let producer = thread::spawn(move || q.push(1).is_err());
        thread::sleep(Duration::from_millis(20));
        queue.terminate();
        assert!(producer.join().unwrap());
    }

    #[test]
    fn test_try_pop_never_blocks() {
        let queue: WorkQueue<u32> = WorkQueue::new(4);
        assert_eq!(queue.try_pop(), None);
        queue.push(9).unwrap();
        assert_eq!(queue.try_pop(), Some(9));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_pop_with_deadline_times_out() {
        let queue: WorkQueue<u32> = WorkQueue::new(4);
        let start = Instant::now();
        let result = queue.pop_with_deadline(Instant::now() + Duration::from_millis(30));
        assert!(matches!(result, PopResult::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pop_with_deadline_returns_item() {
        let queue = WorkQueue::new(4);
        queue.push(7u32).unwrap();
        let result = queue.pop_with_deadline(Instant::now() + Duration::from_millis(100));
        assert!(matches!(result, PopResult::Item(7)));
    }

    #[test]
    fn test_pop_with_deadline_observes_termination() {
        let queue: WorkQueue<u32> = WorkQueue::new(4);
        queue.terminate();
        let result = queue.pop_with_deadline(Instant::now() + Duration::from_secs(5));
        assert!(matches!(result, PopResult::Terminated));
    }

    #[test]
    fn test_restart_reopens_queue() {
        let queue = WorkQueue::new(4);
        queue.push(1u32).unwrap();
        queue.terminate();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);

        queue.restart();
        queue.push(2).unwrap();
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_multi_producer_multi_consumer() {
        let queue: Arc<WorkQueue<u64>> = Arc::new(WorkQueue::new(16));
        let mut producers = vec![];
        for p in 0..4u64 {
            let q = Arc::clone(&queue);
            producers.push(thread::spawn(move || {
                for i in 0..100 {
                    q.push(p * 100 + i).unwrap();
                }
            }));
        }
        let mut consumers = vec![];
        for _ in 0..4 {
            let q = Arc::clone(&queue);
            consumers.push(thread::spawn(move || {
                let mut sum = 0u64;
                while let Some(v) = q.pop() {
                    sum += v;
                }
                sum
            }));
        }
        for p in producers {
            p.join().unwrap();
        }
        queue.terminate();
        let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, (0..400u64).map(|i| (i / 100) * 100 + (i % 100)).sum());
    }
}
