pub mod least_conn;
pub mod round_robin;

use crate::upstream::health::HealthProber;
use crate::upstream::target::Target;
use least_conn::LeastConnBalancer;
use round_robin::RoundRobinBalancer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Balancing strategy selected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastConn,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rr" | "round_robin" => Some(Self::RoundRobin),
            "least_conn" | "least_connections" => Some(Self::LeastConn),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "rr",
            Self::LeastConn => "least_conn",
        }
    }
}

/// Enum-based balancer — no trait objects, no dynamic dispatch.
///
/// Reconfiguration replaces the whole value; in-flight reservations and
/// guards keep the old value's counters alive through shared `Arc`s, so a
/// swap never unbalances anything.
pub enum Balancer {
    RoundRobin(RoundRobinBalancer),
    LeastConn(LeastConnBalancer),
}

impl Balancer {
    pub fn new(
        strategy: Strategy,
        targets: Vec<Arc<Target>>,
        health_check: bool,
        prober: HealthProber,
    ) -> Self {
        match strategy {
            Strategy::RoundRobin => {
                Self::RoundRobin(RoundRobinBalancer::new(targets, health_check, prober))
            }
            Strategy::LeastConn => {
                Self::LeastConn(LeastConnBalancer::new(targets, health_check, prober))
            }
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Self::RoundRobin(_) => Strategy::RoundRobin,
            Self::LeastConn(_) => Strategy::LeastConn,
        }
    }

    pub fn targets(&self) -> Vec<Arc<Target>> {
        match self {
            Self::RoundRobin(b) => b.targets(),
            Self::LeastConn(b) => b.targets(),
        }
    }

    /// Preview pick: what a committing pick would return at this instant,
    /// with no counter mutation. Used only to derive cache keys and rewrite
    /// outbound URLs before the cache check.
    pub async fn preview(&self) -> Option<Arc<Target>> {
        match self {
            Self::RoundRobin(b) => b.preview().await,
            Self::LeastConn(b) => b.preview().await,
        }
    }

    /// Committing pick. Mutates counters (round-robin advance or
    /// least-connections pending reservation). The reservation must be
    /// upgraded via [`Reservation::acquire`] around the real upstream
    /// exchange; dropping it un-upgraded hands the reservation back.
    pub async fn pick(&self) -> Option<Reservation> {
        match self {
            Self::RoundRobin(b) => b.pick().await,
            Self::LeastConn(b) => b.pick().await,
        }
    }
}

/// Shared per-target load counters (least-connections only).
#[derive(Clone)]
pub(crate) struct SlotCounters {
    pub(crate) active: Arc<AtomicUsize>,
    pub(crate) pending: Arc<AtomicUsize>,
}

impl SlotCounters {
    pub(crate) fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// A committed pick that has not yet become an in-flight exchange.
///
/// Holds one `pending` reservation on its target. Dropping it without
/// calling [`Reservation::acquire`] (queue rejection, timeout, client
/// cancellation) releases the reservation, so no exit path can leave a
/// counter unbalanced. Round-robin picks carry no counters and the guards
/// are no-ops.
pub struct Reservation {
    target: Arc<Target>,
    counters: Option<SlotCounters>,
}

impl Reservation {
    pub(crate) fn new(target: Arc<Target>, counters: Option<SlotCounters>) -> Self {
        Self { target, counters }
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    /// Convert the reservation into an in-flight slot: pending−1, active+1
    /// on the same target. The returned guard performs active−1 on drop.
    pub fn acquire(mut self) -> LoadGuard {
        let counters = self.counters.take();
        if let Some(c) = &counters {
            c.pending.fetch_sub(1, Ordering::SeqCst);
            c.active.fetch_add(1, Ordering::SeqCst);
        }
        LoadGuard { counters }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(c) = self.counters.take() {
            c.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// RAII release of one in-flight upstream exchange.
pub struct LoadGuard {
    counters: Option<SlotCounters>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if let Some(c) = &self.counters {
            c.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
