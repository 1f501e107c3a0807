//! Deferred release of delayed requests.
//!
//! Delay-type records hold a request for `err_limit` milliseconds before it
//! proceeds. A single worker thread owns the timing: it sleeps until the
//! nearest deadline (bounded by the poll interval so cancellation is
//! observed promptly) and hands expired payloads to the sink callback.
//! Payloads never expire on the caller's thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Why a payload left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The delay elapsed.
    Expired,
    /// Cancelled before expiry, individually or by a drain.
    Cancelled,
    /// The queue shut down with the payload still pending.
    Shutdown,
}

/// Receives every payload exactly once, tagged with why it was released.
pub type DelaySink<T> = Box<dyn Fn(T, ReleaseReason) + Send + Sync>;

struct Entry<T> {
    deadline: Instant,
    cancelled: bool,
    payload: T,
}

struct DelayState<T> {
    entries: BTreeMap<u64, Entry<T>>,
    next_id: u64,
    shutdown: bool,
}

struct DelayShared<T> {
    state: Mutex<DelayState<T>>,
    wakeup: Condvar,
    sink: DelaySink<T>,
    poll_interval: Duration,
}

impl<T> DelayShared<T> {
    fn lock(&self) -> MutexGuard<'_, DelayState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one pending delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayHandle {
    id: u64,
}

impl DelayHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The delay queue and its worker thread.
pub struct DelayQueue<T: Send + 'static> {
    shared: Arc<DelayShared<T>>,
    worker: Option<JoinHandle<()>>,
    finished: Arc<AtomicBool>,
}

impl<T: Send + 'static> DelayQueue<T> {
    /// Spawns the worker. `poll_interval` bounds how long a cancellation or
    /// shutdown can go unnoticed.
    pub fn new(poll_interval: Duration, sink: DelaySink<T>) -> Self {
        let shared = Arc::new(DelayShared {
            state: Mutex::new(DelayState {
                entries: BTreeMap::new(),
                next_id: 1,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            sink,
            poll_interval,
        });
        let finished = Arc::new(AtomicBool::new(false));
        let worker = {
            let shared = Arc::clone(&shared);
            let finished = Arc::clone(&finished);
            std::thread::Builder::new()
                .name("faultline-delay".into())
                .spawn(move || {
                    worker_loop(&shared);
                    finished.store(true, Ordering::Release);
                })
                .ok()
        };
        if worker.is_none() {
            tracing::error!("failed to spawn delay worker; delays expire on push");
        }
        Self {
            shared,
            worker,
            finished,
        }
    }

    /// Queues `payload` for release after `delay`. The sink sees it exactly
    /// once.
    pub fn push(&self, payload: T, delay: Duration) -> DelayHandle {
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.entries.insert(
                id,
                Entry {
                    deadline: Instant::now() + delay,
                    cancelled: false,
                    payload,
                },
            );
            id
        };
        self.shared.wakeup.notify_one();
        // No worker thread means nothing will ever expire; degrade to an
        // immediate release rather than losing the request.
        if self.worker.is_none() || self.finished.load(Ordering::Acquire) {
            self.release(id, ReleaseReason::Expired);
        }
        DelayHandle { id }
    }

    /// Marks one pending payload for early release on the worker's next
    /// wake. Returns false when it already left the queue or was already
    /// marked.
    pub fn cancel(&self, handle: DelayHandle) -> bool {
        let marked = {
            let mut state = self.shared.lock();
            match state.entries.get_mut(&handle.id) {
                Some(entry) if !entry.cancelled => {
                    entry.cancelled = true;
                    true
                }
                _ => false,
            }
        };
        if marked {
            self.shared.wakeup.notify_one();
        }
        marked
    }

    /// Marks every pending payload matching `pred` for release on the
    /// worker's next wake. Returns how many entries were newly marked.
    pub fn cancel_matching(&self, pred: impl Fn(&T) -> bool) -> usize {
        let marked = {
            let mut state = self.shared.lock();
            let mut marked = 0;
            for entry in state.entries.values_mut() {
                if !entry.cancelled && pred(&entry.payload) {
                    entry.cancelled = true;
                    marked += 1;
                }
            }
            marked
        };
        if marked > 0 {
            self.shared.wakeup.notify_all();
        }
        marked
    }

    /// Marks everything pending for release. Returns how many entries were
    /// newly marked.
    pub fn cancel_all(&self) -> usize {
        let marked = {
            let mut state = self.shared.lock();
            let mut marked = 0;
            for entry in state.entries.values_mut() {
                if !entry.cancelled {
                    entry.cancelled = true;
                    marked += 1;
                }
            }
            marked
        };
        if marked > 0 {
            self.shared.wakeup.notify_all();
        }
        marked
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, id: u64, reason: ReleaseReason) -> bool {
        let payload = self.shared.lock().entries.remove(&id);
        match payload {
            Some(entry) => {
                (self.shared.sink)(entry.payload, reason);
                true
            }
            None => false,
        }
    }
}

impl<T: Send + 'static> Drop for DelayQueue<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("delay worker panicked during shutdown");
            }
        }
        // The worker drains on shutdown; anything left means it was never
        // running.
        let leftovers: Vec<_> = {
            let mut state = self.shared.lock();
            std::mem::take(&mut state.entries)
                .into_values()
                .map(|entry| entry.payload)
                .collect()
        };
        for payload in leftovers {
            (self.shared.sink)(payload, ReleaseReason::Shutdown);
        }
    }
}

fn worker_loop<T>(shared: &DelayShared<T>) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            break;
        }

        let now = Instant::now();
        let ready: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.cancelled || entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if !ready.is_empty() {
            let payloads: Vec<(T, ReleaseReason)> = ready
                .iter()
                .filter_map(|id| {
                    state.entries.remove(id).map(|entry| {
                        let reason = if entry.cancelled {
                            ReleaseReason::Cancelled
                        } else {
                            ReleaseReason::Expired
                        };
                        (entry.payload, reason)
                    })
                })
                .collect();
            drop(state);
            for (payload, reason) in payloads {
                (shared.sink)(payload, reason);
            }
            state = shared.lock();
            continue;
        }

        let until_next = state
            .entries
            .values()
            .map(|entry| entry.deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(shared.poll_interval)
            .min(shared.poll_interval);
        let (guard, _timeout) = shared
            .wakeup
            .wait_timeout(state, until_next)
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
    }

    // Shutdown drain: every payload still leaves through the sink.
    let payloads: Vec<T> = std::mem::take(&mut state.entries)
        .into_values()
        .map(|entry| entry.payload)
        .collect();
    drop(state);
    for payload in payloads {
        (shared.sink)(payload, ReleaseReason::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn channel_queue() -> (DelayQueue<u32>, mpsc::Receiver<(u32, ReleaseReason)>) {
        let (tx, rx) = mpsc::channel();
        let queue = DelayQueue::new(
            Duration::from_millis(10),
            Box::new(move |payload, reason| {
                let _ = tx.send((payload, reason));
            }),
        );
        (queue, rx)
    }

    #[test]
    fn payload_expires_after_delay() {
        let (queue, rx) = channel_queue();
        let start = Instant::now();
        queue.push(7, Duration::from_millis(50));
        let (payload, reason) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let elapsed = start.elapsed();
        assert_eq!(payload, 7);
        assert_eq!(reason, ReleaseReason::Expired);
        assert!(elapsed >= Duration::from_millis(50), "elapsed {elapsed:?}");
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_releases_early_exactly_once() {
        let (queue, rx) = channel_queue();
        let handle = queue.push(1, Duration::from_secs(60));
        assert!(queue.cancel(handle));
        let (payload, reason) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(payload, 1);
        assert_eq!(reason, ReleaseReason::Cancelled);
        // Second cancel is a no-op.
        assert!(!queue.cancel(handle));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_matching_releases_only_matching() {
        let (queue, rx) = channel_queue();
        queue.push(1, Duration::from_secs(60));
        queue.push(2, Duration::from_secs(60));
        queue.push(3, Duration::from_secs(60));
        assert_eq!(queue.cancel_matching(|payload| payload % 2 == 1), 2);
        let mut seen: Vec<u32> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().0)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 3]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_all_drains_pending() {
        let (queue, rx) = channel_queue();
        queue.push(1, Duration::from_secs(60));
        queue.push(2, Duration::from_secs(60));
        assert_eq!(queue.cancel_all(), 2);
        let mut seen: Vec<u32> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().0)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn shutdown_releases_pending_with_shutdown_reason() {
        let (queue, rx) = channel_queue();
        queue.push(9, Duration::from_secs(60));
        drop(queue);
        let (payload, reason) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(payload, 9);
        assert_eq!(reason, ReleaseReason::Shutdown);
    }

    #[test]
    fn earlier_deadline_wakes_before_poll_ceiling() {
        let (queue, rx) = channel_queue();
        queue.push(1, Duration::from_secs(60));
        let start = Instant::now();
        queue.push(2, Duration::from_millis(20));
        let (payload, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(payload, 2);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(queue.len(), 1);
    }
}
