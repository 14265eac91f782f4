/*
 * Copyright 2026 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! A rate-limited, deduplicating work queue feeding a pool of workers.
//!
//! Keys enqueued while already pending are dropped; keys enqueued while
//! being processed are dispatched at most once more, after the in-flight
//! pass finishes. Failed keys are retried on a fast/slow backoff schedule
//! that resets on success.

use std::{
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

use crate::signal::ShutdownRx;

/// How long workers may go without dequeuing or finishing an item, while
/// work is in flight, before the queue reports itself unhealthy.
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry schedule for failing keys: a short delay for the first
/// `max_fast_attempts` requeues of a key, a long delay after.
#[derive(Clone, Copy, Debug)]
pub struct FastSlowRateLimiter {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: u32,
}

impl FastSlowRateLimiter {
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: u32) -> Self {
        Self {
            fast,
            slow,
            max_fast_attempts,
        }
    }

    fn delay(&self, attempts: u32) -> Duration {
        if attempts <= self.max_fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }
}

impl Default for FastSlowRateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5), 10)
    }
}

pub struct WorkerQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkerQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K> {
    name: &'static str,
    limiter: FastSlowRateLimiter,
    state: parking_lot::Mutex<State<K>>,
    notify: Notify,
    busy: AtomicUsize,
    last_progress_millis: AtomicU64,
    epoch: Instant,
}

struct State<K> {
    ready: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    delayed: BinaryHeap<Delayed<K>>,
    requeues: HashMap<K, u32>,
    seq: u64,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            delayed: BinaryHeap::new(),
            requeues: HashMap::new(),
            seq: 0,
        }
    }
}

/// Entry in the delay heap; ordered so the heap pops the earliest deadline.
struct Delayed<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K> WorkerQueue<K>
where
    K: std::fmt::Display + Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self::with_rate_limiter(name, FastSlowRateLimiter::default())
    }

    pub fn with_rate_limiter(name: &'static str, limiter: FastSlowRateLimiter) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                limiter,
                state: parking_lot::Mutex::default(),
                notify: Notify::new(),
                busy: AtomicUsize::new(0),
                last_progress_millis: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        }
    }

    /// Queues the key after its rate-limiter delay. Repeated enqueues of a
    /// failing key escalate the delay; [`Self::forget`] resets it.
    pub fn enqueue(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock();
            let attempts = state.requeues.entry(key.clone()).or_insert(0);
            *attempts += 1;
            let delay = self.inner.limiter.delay(*attempts);
            state.seq += 1;
            let seq = state.seq;
            state.delayed.push(Delayed {
                at: Instant::now() + delay,
                seq,
                key: key.clone(),
            });
            delay
        };
        // wake a sleeper so it recomputes its deadline
        self.inner.notify.notify_one();
        tracing::debug!(queue = self.inner.name, %key, ?delay, "queueing with delay");
    }

    /// Queues the key now, bypassing rate limiting.
    pub fn enqueue_immediately(&self, key: K) {
        tracing::debug!(queue = self.inner.name, %key, "queueing immediately");
        let mut state = self.inner.state.lock();
        self.add(&mut state, key);
    }

    /// Runs `workers` consumers until the shutdown channel fires. Each
    /// consumer invokes `sync` per dequeued key; a non-`Ok` outcome requeues
    /// the key with backoff, `Ok` resets its backoff. In-flight passes run
    /// to completion on shutdown.
    pub async fn run<F, Fut>(&self, workers: usize, shutdown: ShutdownRx, sync: F)
    where
        F: Fn(K) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        tracing::info!(queue = self.inner.name, workers, "starting workers");

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..workers {
            let queue = self.clone();
            let sync = sync.clone();
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                while let Some(key) = queue.next(&mut shutdown).await {
                    queue.inner.busy.fetch_add(1, Ordering::SeqCst);
                    let result = (sync)(key.clone()).await;
                    queue.inner.busy.fetch_sub(1, Ordering::SeqCst);
                    queue.touch();

                    match result {
                        Ok(()) => queue.forget(&key),
                        Err(error) => {
                            tracing::error!(
                                queue = queue.inner.name,
                                %key,
                                error = format!("{error:?}"),
                                "error syncing, requeueing"
                            );
                            queue.enqueue(key.clone());
                        }
                    }
                    queue.done(&key);
                }
            });
        }

        while tasks.join_next().await.is_some() {}
        tracing::info!(queue = self.inner.name, "workers drained");
    }

    /// True while consumers are idle or making progress; false once work is
    /// in flight but nothing has been dequeued or finished recently.
    pub fn healthy(&self) -> bool {
        if self.inner.busy.load(Ordering::SeqCst) == 0 {
            return true;
        }
        let now = self.millis_since_epoch();
        let last = self.inner.last_progress_millis.load(Ordering::SeqCst);
        now.saturating_sub(last) < STALL_TIMEOUT.as_millis() as u64
    }

    async fn next(&self, shutdown: &mut ShutdownRx) -> Option<K> {
        loop {
            let deadline = {
                let mut state = self.inner.state.lock();
                self.promote_expired(&mut state);

                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.touch();
                    return Some(key);
                }

                state.delayed.peek().map(|delayed| delayed.at)
            };

            // the notify permit covers wakeups raced between unlock and await
            let deadline =
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }

    fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.ready.push_back(key.clone());
            self.inner.notify.notify_one();
        }
        self.touch();
    }

    fn forget(&self, key: &K) {
        self.inner.state.lock().requeues.remove(key);
    }

    fn add(&self, state: &mut State<K>, key: K) {
        if state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.ready.push_back(key);
            self.inner.notify.notify_one();
        }
    }

    fn promote_expired(&self, state: &mut State<K>) {
        let now = Instant::now();
        while state
            .delayed
            .peek()
            .is_some_and(|delayed| delayed.at <= now)
        {
            let delayed = state.delayed.pop().unwrap();
            self.add(state, delayed.key);
        }
    }

    fn touch(&self) {
        self.inner
            .last_progress_millis
            .store(self.millis_since_epoch(), Ordering::SeqCst);
    }

    fn millis_since_epoch(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    #[cfg(test)]
    pub(crate) fn is_ready(&self, key: &K) -> bool {
        self.inner.state.lock().ready.contains(key)
    }

    #[cfg(test)]
    pub(crate) fn is_queued(&self, key: &K) -> bool {
        let state = self.inner.state.lock();
        state.dirty.contains(key) || state.delayed.iter().any(|delayed| delayed.key == *key)
    }

    #[cfg(test)]
    pub(crate) fn requeue_count(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .requeues
            .get(key)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkerQueue<String> {
        WorkerQueue::new("test-queue")
    }

    #[tokio::test]
    async fn enqueue_immediately_deduplicates_pending_keys() {
        let queue = queue();
        queue.enqueue_immediately("a".to_string());
        queue.enqueue_immediately("a".to_string());
        queue.enqueue_immediately("a".to_string());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = crate::signal::channel();

        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(1, shutdown_rx, move |key: String| {
                        let tx = tx.clone();
                        async move {
                            tx.send(key).unwrap();
                            Ok(())
                        }
                    })
                    .await;
            })
        };

        assert_eq!(rx.recv().await.unwrap(), "a");
        // the two extra enqueues collapsed into the single pending entry
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );

        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn key_requeued_while_processing_dispatches_once_more() {
        let queue = queue();
        let (dispatched_tx, mut dispatched) = tokio::sync::mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let gate_rx = Arc::new(tokio::sync::Mutex::new(gate_rx));
        let (shutdown_tx, shutdown_rx) = crate::signal::channel();

        queue.enqueue_immediately("a".to_string());

        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(1, shutdown_rx, move |key: String| {
                        let dispatched_tx = dispatched_tx.clone();
                        let gate_rx = gate_rx.clone();
                        async move {
                            dispatched_tx.send(key).unwrap();
                            gate_rx.lock().await.recv().await;
                            Ok(())
                        }
                    })
                    .await;
            })
        };

        // first dispatch is now in flight, blocked on the gate
        assert_eq!(dispatched.recv().await.unwrap(), "a");

        queue.enqueue_immediately("a".to_string());
        queue.enqueue_immediately("a".to_string());
        queue.enqueue_immediately("a".to_string());
        gate_tx.send(()).unwrap();

        // exactly one further dispatch for the three re-adds
        assert_eq!(dispatched.recv().await.unwrap(), "a");
        gate_tx.send(()).unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), dispatched.recv())
                .await
                .is_err()
        );

        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_keys_back_off_fast_then_slow() {
        let queue = queue();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = crate::signal::channel();

        queue.enqueue("a".to_string());

        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(1, shutdown_rx, move |_key: String| {
                        let tx = tx.clone();
                        async move {
                            tx.send(Instant::now()).unwrap();
                            Err(eyre::eyre!("synthetic failure"))
                        }
                    })
                    .await;
            })
        };

        let mut attempts = Vec::new();
        for _ in 0..12 {
            attempts.push(rx.recv().await.unwrap());
        }

        // attempts 1..=10 are spaced at the fast interval, later ones at the
        // slow interval
        for pair in attempts[..10].windows(2) {
            let delta = pair[1] - pair[0];
            assert!(delta >= Duration::from_millis(100) && delta < Duration::from_secs(5));
        }
        assert!(attempts[11] - attempts[10] >= Duration::from_secs(5));

        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn success_resets_backoff() {
        let queue = queue();
        let key = "a".to_string();

        queue.enqueue(key.clone());
        queue.enqueue(key.clone());
        queue.enqueue(key.clone());
        assert_eq!(queue.requeue_count(&key), 3);

        queue.forget(&key);
        assert_eq!(queue.requeue_count(&key), 0);
    }

    #[tokio::test]
    async fn enqueue_rate_limits_while_immediate_bypasses() {
        let queue = queue();
        let key = "a".to_string();

        queue.enqueue(key.clone());
        assert!(queue.is_queued(&key));
        assert!(!queue.is_ready(&key));

        queue.enqueue_immediately(key.clone());
        assert!(queue.is_ready(&key));
    }

    #[tokio::test]
    async fn idle_queue_is_healthy() {
        let queue = queue();
        assert!(queue.healthy());
        queue.enqueue_immediately("a".to_string());
        assert!(queue.healthy());
    }

    #[tokio::test]
    async fn shutdown_drains_workers() {
        let queue = queue();
        let (shutdown_tx, shutdown_rx) = crate::signal::channel();

        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(4, shutdown_rx, |_key: String| async move { Ok(()) })
                    .await;
            })
        };

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("workers should stop after shutdown")
            .unwrap();
    }
}
