use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Why a request never reached an active slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// The waiting room was full at entry.
    Full,
    /// The enqueue timeout elapsed before an active slot freed up.
    TimedOut,
    /// The client went away while the request was queued.
    Cancelled,
}

/// Proof of admission. Holds the active slot for the span of the inner
/// handler; dropping it releases the slot.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    /// Number of requests already waiting when this one entered the queue.
    pub depth_at_entry: i64,
    /// Time spent between entering the queue and winning an active slot.
    pub waited: Duration,
}

/// Bounded waiting room in front of a bounded active set.
///
/// Both resources are counting semaphores; `depth` mirrors the number of
/// requests currently holding a waiting slot. Every exit path (admission,
/// rejection, timeout, cancellation) leaves the caller holding exactly the
/// slots it is entitled to: one active permit on success, none otherwise.
pub struct AdmissionQueue {
    waiting: Arc<Semaphore>,
    active: Arc<Semaphore>,
    depth: AtomicI64,
    max_queue: usize,
    max_concurrent: usize,
    enqueue_timeout: Duration,
}

impl AdmissionQueue {
    pub fn new(max_queue: usize, max_concurrent: usize, enqueue_timeout: Duration) -> Self {
        Self {
            waiting: Arc::new(Semaphore::new(max_queue)),
            active: Arc::new(Semaphore::new(max_concurrent)),
            depth: AtomicI64::new(0),
            max_queue,
            max_concurrent,
            enqueue_timeout,
        }
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Current number of waiters.
    pub fn depth(&self) -> i64 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Admit one request.
    ///
    /// Fails fast when the waiting room is full; otherwise races active-slot
    /// acquisition against the enqueue timeout and the caller's cancellation
    /// token. Dropping the losing acquisition future inside `select!` cancels
    /// it, so a timed-out or cancelled request can never obtain an active
    /// slot later. The waiting slot is released on every path before this
    /// returns, so `depth` only ever counts true waiters.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<Admission, AdmissionError> {
        let waiting = match self.waiting.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::counter!("proxy_queue_rejected_total").increment(1);
                return Err(AdmissionError::Full);
            }
        };

        let depth_at_entry = self.depth.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("proxy_queue_depth").increment(1.0);
        let start = Instant::now();

        let outcome = tokio::select! {
            permit = self.active.clone().acquire_owned() => Ok(permit),
            _ = tokio::time::sleep(self.enqueue_timeout) => Err(AdmissionError::TimedOut),
            _ = cancel.cancelled() => Err(AdmissionError::Cancelled),
        };

        let waited = start.elapsed();
        self.depth.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!("proxy_queue_depth").decrement(1.0);
        drop(waiting);
        metrics::histogram!("proxy_queue_wait_seconds").record(waited.as_secs_f64());

        match outcome {
            Ok(Ok(permit)) => Ok(Admission {
                _permit: permit,
                depth_at_entry,
                waited,
            }),
            // The active semaphore is never closed; treat a closed error the
            // same as cancellation during shutdown.
            Ok(Err(_)) => Err(AdmissionError::Cancelled),
            Err(AdmissionError::TimedOut) => {
                metrics::counter!("proxy_queue_timeouts_total").increment(1);
                Err(AdmissionError::TimedOut)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn queue(max_queue: usize, max_concurrent: usize, timeout_ms: u64) -> Arc<AdmissionQueue> {
        Arc::new(AdmissionQueue::new(
            max_queue,
            max_concurrent,
            Duration::from_millis(timeout_ms),
        ))
    }

    #[tokio::test]
    async fn test_admission_ceilings() {
        let q = queue(2, 1, 1000);
        let cancel = CancellationToken::new();

        let admitted = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let q = q.clone();
            let cancel = cancel.clone();
            let admitted = admitted.clone();
            let rejected = rejected.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                match q.admit(&cancel).await {
                    Ok(admission) => {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        admitted.fetch_add(1, Ordering::SeqCst);
                        drop(admission);
                    }
                    Err(AdmissionError::Full) => {
                        rejected.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("unexpected admission error: {:?}", e),
                }
            }));
            // Stagger arrivals so the first request is already active and the
            // next two are parked before the overflow arrives.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 3);
        assert_eq!(rejected.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn test_timeout_while_queued() {
        let q = queue(1, 1, 10);
        let cancel = CancellationToken::new();

        let holder = q.admit(&cancel).await.unwrap();

        let start = Instant::now();
        let err = q.admit(&cancel).await.unwrap_err();
        assert_eq!(err, AdmissionError::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(q.depth(), 0);

        drop(holder);
    }

    #[tokio::test]
    async fn test_cancellation_while_queued() {
        let q = queue(1, 1, 5_000);
        let cancel = CancellationToken::new();

        let holder = q.admit(&cancel).await.unwrap();

        let waiter = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.admit(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.depth(), 1);

        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, AdmissionError::Cancelled);
        assert_eq!(q.depth(), 0);

        drop(holder);
    }

    #[tokio::test]
    async fn test_lost_race_does_not_leak_active_slot() {
        let q = queue(1, 1, 10);
        let cancel = CancellationToken::new();

        let holder = q.admit(&cancel).await.unwrap();
        assert_eq!(
            q.admit(&cancel).await.unwrap_err(),
            AdmissionError::TimedOut
        );

        // Freeing the holder must leave exactly one active slot available:
        // the timed-out request's cancelled acquisition consumed nothing.
        drop(holder);
        let again = q.admit(&cancel).await.unwrap();
        assert_eq!(again.depth_at_entry, 0);
    }

    #[tokio::test]
    async fn test_admission_reports_wait_and_depth() {
        let q = queue(4, 1, 5_000);
        let cancel = CancellationToken::new();

        let holder = q.admit(&cancel).await.unwrap();
        assert_eq!(holder.depth_at_entry, 0);
        assert!(holder.waited < Duration::from_millis(100));

        let waiter = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.admit(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(holder);

        let admission = waiter.await.unwrap().unwrap();
        assert!(admission.waited >= Duration::from_millis(40));
    }
}
