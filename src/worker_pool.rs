//! Bounded-concurrency task executor shared by the crawler components.
//!
//! Producers hand items to a bounded queue; a fixed set of workers pulls
//! them, runs the processor under a per-item timeout, and paces itself with
//! an inter-task delay. Failures are logged and never tear down the pool.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::CrawlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker queue is full")]
pub struct QueueFull;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub label: &'static str,
    pub n_workers: usize,
    pub max_queue: usize,
    pub per_task_timeout: Option<Duration>,
    pub inter_task_delay: Duration,
}

impl PoolConfig {
    pub fn new(label: &'static str, n_workers: usize) -> Self {
        PoolConfig {
            label,
            n_workers,
            max_queue: n_workers * 2,
            per_task_timeout: Some(Duration::from_secs(60)),
            inter_task_delay: Duration::from_secs(1),
        }
    }

    pub fn max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    pub fn per_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.per_task_timeout = timeout;
        self
    }

    pub fn inter_task_delay(mut self, delay: Duration) -> Self {
        self.inter_task_delay = delay;
        self
    }
}

pub struct WorkerPool<T> {
    tx: mpsc::Sender<T>,
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    label: &'static str,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F, Fut>(config: PoolConfig, processor: F) -> Arc<Self>
    where
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        assert!(config.n_workers >= 1, "need at least one worker");
        let (tx, rx) = mpsc::channel(config.max_queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (stop, _) = watch::channel(false);

        let mut workers = Vec::with_capacity(config.n_workers);
        for i in 0..config.n_workers {
            let rx = Arc::clone(&rx);
            let mut stop_rx = stop.subscribe();
            let processor = processor.clone();
            let config = config.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = stop_rx.changed() => None,
                            item = rx.recv() => item,
                        }
                    };
                    let Some(item) = item else { break };
                    // Pending items are dropped once the pool is closing
                    if *stop_rx.borrow() {
                        break;
                    }

                    let work = processor(item);
                    let outcome = match config.per_task_timeout {
                        Some(limit) => match tokio::time::timeout(limit, work).await {
                            Ok(result) => result,
                            Err(_) => {
                                eprintln!(
                                    "⚠️ {} worker {}: item processing timed out after {:?}",
                                    config.label, i, limit
                                );
                                continue;
                            }
                        },
                        None => work.await,
                    };

                    if let Err(e) = outcome {
                        eprintln!("⚠️ {} worker {}: item processing failed: {}", config.label, i, e);
                    } else if !config.inter_task_delay.is_zero() {
                        tokio::time::sleep(config.inter_task_delay).await;
                    }
                }
            }));
        }

        Arc::new(WorkerPool {
            tx,
            stop,
            workers: Mutex::new(workers),
            label: config.label,
        })
    }

    /// Enqueue an item, suspending while the queue is full.
    pub async fn enqueue(&self, item: T) {
        if self.tx.send(item).await.is_err() {
            eprintln!("⚠️ {}: dropping item, pool is closed", self.label);
        }
    }

    /// Enqueue an item without blocking; fails when the queue is full.
    pub fn enqueue_nowait(&self, item: T) -> Result<(), QueueFull> {
        self.tx.try_send(item).map_err(|_| QueueFull)
    }

    /// Signal termination. Pending items drop; in-flight items complete
    /// unless `force` aborts the workers outright.
    pub fn close(&self, force: bool) {
        let _ = self.stop.send(true);
        if force {
            let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            for w in workers.iter() {
                w.abort();
            }
        }
    }

    /// Join all workers. Call after `close`.
    pub async fn wait_closed(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Counts item completions of a scheduled batch so a periodic pass can wait
/// for all of its enqueued work before sweeping and sleeping.
pub struct WaitCounter {
    remaining: Mutex<usize>,
    notify: tokio::sync::Notify,
}

impl WaitCounter {
    pub fn new(count: usize) -> Self {
        WaitCounter {
            remaining: Mutex::new(count),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub fn submit(&self) {
        let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
                if *remaining == 0 {
                    return;
                }
            }
            notified.await;
        }
    }
}

/// Submits to a [`WaitCounter`] on drop, so an item counts as done even when
/// its processing future is dropped by the pool timeout.
pub struct CounterGuard(pub Arc<WaitCounter>);

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.submit();
    }
}
