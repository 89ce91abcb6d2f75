use super::{Reservation, SlotCounters};
use crate::upstream::health::HealthProber;
use crate::upstream::target::Target;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Least-connections selection with pending reservations.
///
/// Load = active + pending for committing picks, active only for previews.
/// Ties break to the earliest target in list order. A committing pick wins
/// its target through a compare-and-swap on the `pending` value observed
/// during the scan; a failed swap means another pick got there first, and
/// the scan is retried against fresh counters.
pub struct LeastConnBalancer {
    slots: Vec<TargetSlot>,
    health_check: bool,
    prober: HealthProber,
}

struct TargetSlot {
    target: Arc<Target>,
    counters: SlotCounters,
}

impl LeastConnBalancer {
    pub fn new(targets: Vec<Arc<Target>>, health_check: bool, prober: HealthProber) -> Self {
        let slots = targets
            .into_iter()
            .map(|target| TargetSlot {
                target,
                counters: SlotCounters::new(),
            })
            .collect();
        Self {
            slots,
            health_check,
            prober,
        }
    }

    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.slots.iter().map(|s| s.target.clone()).collect()
    }

    pub async fn preview(&self) -> Option<Arc<Target>> {
        let mask = self.healthy_mask().await;
        let mut best: Option<(usize, usize)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if !mask[i] {
                continue;
            }
            let load = slot.counters.active.load(Ordering::SeqCst);
            if best.map_or(true, |(_, b)| load < b) {
                best = Some((i, load));
            }
        }
        best.map(|(i, _)| self.slots[i].target.clone())
    }

    pub async fn pick(&self) -> Option<Reservation> {
        let mask = self.healthy_mask().await;
        loop {
            let mut best: Option<(usize, usize, usize)> = None;
            for (i, slot) in self.slots.iter().enumerate() {
                if !mask[i] {
                    continue;
                }
                let pending = slot.counters.pending.load(Ordering::SeqCst);
                let load = slot.counters.active.load(Ordering::SeqCst) + pending;
                if best.map_or(true, |(_, b, _)| load < b) {
                    best = Some((i, load, pending));
                }
            }
            let (i, _, pending_seen) = best?;
            let slot = &self.slots[i];
            // Reserve against the value the scan saw; a concurrent pick that
            // beat us invalidates the comparison and forces a re-scan.
            if slot
                .counters
                .pending
                .compare_exchange(
                    pending_seen,
                    pending_seen + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Some(Reservation::new(
                    slot.target.clone(),
                    Some(slot.counters.clone()),
                ));
            }
        }
    }

    async fn healthy_mask(&self) -> Vec<bool> {
        if !self.health_check {
            return vec![true; self.slots.len()];
        }
        let mut mask = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            mask.push(self.prober.probe(&slot.target).await);
        }
        mask
    }

    #[cfg(test)]
    fn load_of(&self, host: &str) -> (usize, usize) {
        let slot = self
            .slots
            .iter()
            .find(|s| s.target.host() == host)
            .expect("unknown test target");
        (
            slot.counters.active.load(Ordering::SeqCst),
            slot.counters.pending.load(Ordering::SeqCst),
        )
    }
}
