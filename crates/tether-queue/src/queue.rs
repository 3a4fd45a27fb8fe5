use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

/// Multi-producer / single-consumer(-ish) FIFO guarded by a single lock.
///
/// Every operation takes the same mutex; `push_back`/`push_front`
/// additionally notify a condition variable so [`BlockingQueue::wait`]
/// can block without polling. Ordering across producers is "whichever
/// thread entered the critical section first" — within one producer
/// thread, order is preserved.
///
/// Grounded on the same mutex-guarded-deque shape as the original
/// source's `thread_safe_queue` (`net_thread_safe_queue.h`), but `wait`
/// is a real condvar wait rather than a 10ms polling sleep loop.
pub struct BlockingQueue<E> {
    deque: Mutex<VecDeque<E>>,
    not_empty: Condvar,
}

impl<E> Default for BlockingQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> BlockingQueue<E> {
    pub fn new() -> Self {
        Self { deque: Mutex::new(VecDeque::new()), not_empty: Condvar::new() }
    }

    pub fn push_back(&self, item: E) {
        let mut guard = self.deque.lock().unwrap();
        guard.push_back(item);
        self.not_empty.notify_one();
    }

    pub fn push_front(&self, item: E) {
        let mut guard = self.deque.lock().unwrap();
        guard.push_front(item);
        self.not_empty.notify_one();
    }

    pub fn pop_front(&self) -> Option<E> {
        self.deque.lock().unwrap().pop_front()
    }

    pub fn pop_back(&self) -> Option<E> {
        self.deque.lock().unwrap().pop_back()
    }

    /// Clones the front element without removing it.
    pub fn front(&self) -> Option<E>
    where
        E: Clone,
    {
        self.deque.lock().unwrap().front().cloned()
    }

    /// Clones the back element without removing it.
    pub fn back(&self) -> Option<E>
    where
        E: Clone,
    {
        self.deque.lock().unwrap().back().cloned()
    }

    pub fn empty(&self) -> bool {
        self.deque.lock().unwrap().is_empty()
    }

    pub fn count(&self) -> usize {
        self.deque.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.deque.lock().unwrap().clear();
    }

    /// Blocks until the queue is non-empty. Does not itself dequeue: the
    /// caller pops under its own discipline after waking. Safe against
    /// spurious wakeups (re-checks emptiness in a loop).
    pub fn wait(&self) {
        let guard = self.deque.lock().unwrap();
        let _guard = self.not_empty.wait_while(guard, |q| q.is_empty()).unwrap();
    }

    /// Drains up to `max` items, calling `f` for each, in FIFO order.
    /// Returns the number of items processed.
    pub fn drain_front<F: FnMut(E)>(&self, max: usize, mut f: F) -> usize {
        let mut n = 0;
        while n < max {
            let Some(item) = self.pop_front() else { break };
            f(item);
            n += 1;
        }
        n
    }
}

impl<E> std::fmt::Debug for BlockingQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockingQueue {{ count: {} }}", self.count())
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn fifo_single_producer() {
        let q: BlockingQueue<u32> = BlockingQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        assert_eq!(q.count(), 3);
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(2));
        assert_eq!(q.pop_front(), Some(3));
        assert_eq!(q.pop_front(), None);
        assert!(q.empty());
    }

    #[test]
    fn push_front_and_back() {
        let q: BlockingQueue<u32> = BlockingQueue::new();
        q.push_back(1);
        q.push_front(0);
        q.push_back(2);
        assert_eq!(q.pop_front(), Some(0));
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(2));
    }

    #[test]
    fn front_and_back_peek_without_removing() {
        let q: BlockingQueue<u32> = BlockingQueue::new();
        assert_eq!(q.front(), None);
        assert_eq!(q.back(), None);
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        assert_eq!(q.front(), Some(1));
        assert_eq!(q.back(), Some(3));
        assert_eq!(q.count(), 3, "peeking must not dequeue");
        assert_eq!(q.pop_front(), Some(1));
    }

    #[test]
    fn clear_wakes_no_one() {
        let q: BlockingQueue<u32> = BlockingQueue::new();
        q.push_back(1);
        q.clear();
        assert!(q.empty());
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn wait_blocks_until_pushed() {
        let q = Arc::new(BlockingQueue::<u32>::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            q2.wait();
            q2.pop_front()
        });
        thread::sleep(Duration::from_millis(20));
        q.push_back(42);
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn drain_front_respects_max() {
        let q: BlockingQueue<u32> = BlockingQueue::new();
        for i in 0..5 {
            q.push_back(i);
        }
        let mut seen = Vec::new();
        let n = q.drain_front(3, |item| seen.push(item));
        assert_eq!(n, 3);
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(q.count(), 2);
    }
}
