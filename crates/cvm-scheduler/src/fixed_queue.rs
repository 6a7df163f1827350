//! Bounded FIFO shared by producers (the scheduler) and consumers (processes).
//!
//! Enqueue never blocks: a full queue hands the element back. Consumers park
//! in [`FixedFifo::dequeue_or_wait_for_next_element_context`] and are served
//! in arrival order through tickets; each wait ends on an element, on
//! cancellation, on an optional deadline or on close.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::cancel::CancelToken;

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError<T> {
    Full(T),
    Closed(T),
}

impl<T> EnqueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full(v) | EnqueueError::Closed(v) => v,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Item(T),
    Cancelled,
    TimedOut,
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    closed: bool,
}

struct Shared<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct FixedFifo<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for FixedFifo<T> {
    fn clone(&self) -> Self {
        FixedFifo {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for FixedFifo<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("FixedFifo")
            .field("capacity", &self.shared.capacity)
            .field("len", &st.items.len())
            .field("waiters", &st.waiters.len())
            .field("closed", &st.closed)
            .finish()
    }
}

impl<T: Send + 'static> FixedFifo<T> {
    pub fn new(capacity: usize) -> Self {
        FixedFifo {
            shared: Arc::new(Shared {
                capacity,
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.min(1024)),
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumers currently parked waiting for an element.
    pub fn waiting_num(&self) -> usize {
        self.shared.lock().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        let mut st = self.shared.lock();
        if st.closed {
            return Err(EnqueueError::Closed(item));
        }
        if st.items.len() >= self.shared.capacity {
            return Err(EnqueueError::Full(item));
        }
        st.items.push_back(item);
        drop(st);
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Puts back an element a consumer took but could not serve. Ignores
    /// capacity since the element held a slot a moment ago.
    pub fn requeue_front(&self, item: T) -> Result<(), T> {
        let mut st = self.shared.lock();
        if st.closed {
            return Err(item);
        }
        st.items.push_front(item);
        drop(st);
        self.shared.cond.notify_all();
        Ok(())
    }

    pub fn dequeue_or_wait_for_next_element_context(
        &self,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> WaitOutcome<T> {
        let shared = Arc::clone(&self.shared);
        let _wake = cancel.on_cancel(move || {
            let _g = shared.lock();
            shared.cond.notify_all();
        });

        let mut st = self.shared.lock();
        let ticket = st.next_ticket;
        st.next_ticket = st.next_ticket.wrapping_add(1);
        st.waiters.push_back(ticket);

        let outcome = loop {
            if st.closed {
                break WaitOutcome::Closed;
            }
            if cancel.is_cancelled() {
                break WaitOutcome::Cancelled;
            }
            if st.waiters.front() == Some(&ticket) {
                if let Some(item) = st.items.pop_front() {
                    break WaitOutcome::Item(item);
                }
            }
            match deadline {
                None => {
                    st = self
                        .shared
                        .cond
                        .wait(st)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break WaitOutcome::TimedOut;
                    }
                    st = match self.shared.cond.wait_timeout(st, deadline - now) {
                        Ok((g, _)) => g,
                        Err(e) => e.into_inner().0,
                    };
                }
            }
        };

        st.waiters.retain(|t| *t != ticket);
        drop(st);
        // The next ticket in line may now be at the front.
        self.shared.cond.notify_all();
        outcome
    }

    /// Pops elements from the head while `pred` holds.
    pub fn pop_head_while(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut st = self.shared.lock();
        let mut out = Vec::new();
        while st.items.front().is_some_and(&mut pred) {
            if let Some(item) = st.items.pop_front() {
                out.push(item);
            }
        }
        out
    }

    pub fn drain(&self) -> Vec<T> {
        self.shared.lock().items.drain(..).collect()
    }

    /// Rejects further enqueues and releases every parked consumer.
    pub fn close(&self) {
        let mut st = self.shared.lock();
        st.closed = true;
        drop(st);
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn full_queue_hands_the_element_back() {
        let q = FixedFifo::new(2);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert_eq!(q.enqueue(3), Err(EnqueueError::Full(3)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.drain(), vec![1, 2]);
        q.enqueue(3).unwrap();
        assert_eq!(q.drain(), vec![3]);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let q = FixedFifo::<u32>::new(8);
        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for id in 0..3u32 {
            let q2 = q.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let token = CancelToken::new();
                if let WaitOutcome::Item(v) =
                    q2.dequeue_or_wait_for_next_element_context(&token, None)
                {
                    tx.send((id, v)).unwrap();
                }
            }));
            // Park each consumer before starting the next.
            wait_until(|| q.waiting_num() == id as usize + 1);
        }

        for v in 10..13 {
            q.enqueue(v).unwrap();
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut got: Vec<(u32, u32)> = rx.try_iter().collect();
        got.sort();
        assert_eq!(got, vec![(0, 10), (1, 11), (2, 12)]);
    }

    #[test]
    fn cancel_wakes_a_parked_consumer_promptly() {
        let q = FixedFifo::<u32>::new(1);
        let token = CancelToken::new();
        let q2 = q.clone();
        let t2 = token.clone();
        let h = thread::spawn(move || q2.dequeue_or_wait_for_next_element_context(&t2, None));
        wait_until(|| q.waiting_num() == 1);

        let started = Instant::now();
        token.cancel();
        assert_eq!(h.join().unwrap(), WaitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(q.waiting_num(), 0);
    }

    #[test]
    fn deadline_and_close_end_the_wait() {
        let q = FixedFifo::<u32>::new(1);
        let token = CancelToken::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(
            q.dequeue_or_wait_for_next_element_context(&token, Some(deadline)),
            WaitOutcome::TimedOut
        );

        let q2 = q.clone();
        let h = thread::spawn(move || {
            q2.dequeue_or_wait_for_next_element_context(&CancelToken::new(), None)
        });
        wait_until(|| q.waiting_num() == 1);
        q.close();
        assert_eq!(h.join().unwrap(), WaitOutcome::Closed);
        assert_eq!(q.enqueue(1), Err(EnqueueError::Closed(1)));
    }

    #[test]
    fn cancelled_token_wins_over_available_item() {
        let q = FixedFifo::new(1);
        q.enqueue(5).unwrap();
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(
            q.dequeue_or_wait_for_next_element_context(&token, None),
            WaitOutcome::Cancelled
        );
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pop_head_while_stops_at_first_mismatch() {
        let q = FixedFifo::new(8);
        for v in [1, 2, 9, 3] {
            q.enqueue(v).unwrap();
        }
        assert_eq!(q.pop_head_while(|v| *v < 5), vec![1, 2]);
        q.requeue_front(0).unwrap();
        assert_eq!(q.drain(), vec![0, 9, 3]);
    }
}
