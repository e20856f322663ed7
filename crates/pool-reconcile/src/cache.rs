//! The in-memory state cache (§2, §3): rebuilt every tick, the authoritative
//! view consumed by the control-plane API and dashboard. Only the
//! reconciler writes derived fields; the claim coordinator writes only the
//! entries it owns via the claim-in-progress set (§5).

use parking_lot::RwLock;
use pool_proto::{Instance, PoolCounts, PoolState};
use std::collections::HashMap;

#[derive(Default)]
pub struct PoolCache {
    inner: RwLock<HashMap<String, Instance>>,
}

impl PoolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instance: Instance) {
        self.inner.write().insert(instance.id.clone(), instance);
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.inner.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Instance> {
        self.inner.write().remove(id)
    }

    pub fn all(&self) -> Vec<Instance> {
        self.inner.read().values().cloned().collect()
    }

    pub fn claimed_entries(&self) -> Vec<Instance> {
        self.inner
            .read()
            .values()
            .filter(|i| i.state == PoolState::Claimed)
            .cloned()
            .collect()
    }

    pub fn find_by_service_id(&self, service_id: &str) -> Option<Instance> {
        self.inner.read().values().find(|i| i.service_id == service_id).cloned()
    }

    /// Pick one idle instance not currently claim-in-progress. Callers must
    /// still race against [`crate::claim::ClaimCoordinator`] on the winning
    /// id; this is a candidate, not a reservation.
    pub fn pick_idle(&self, skip: impl Fn(&str) -> bool) -> Option<Instance> {
        self.inner
            .read()
            .values()
            .find(|i| i.state == PoolState::Idle && !skip(&i.service_id))
            .cloned()
    }

    /// Remove any cache entry whose service id is not in `present_ids` and
    /// is not itself claim-in-progress (§4.3 step 6).
    pub fn retain_present(&self, present_ids: &std::collections::HashSet<String>, skip: impl Fn(&str) -> bool) {
        self.inner
            .write()
            .retain(|_, i| present_ids.contains(&i.service_id) || skip(&i.service_id));
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for instance in self.inner.read().values() {
            match instance.state {
                PoolState::Starting => counts.starting += 1,
                PoolState::Idle => counts.idle += 1,
                PoolState::Claimed => counts.claimed += 1,
                PoolState::Crashed => counts.crashed += 1,
                PoolState::Sleeping | PoolState::Dead => {}
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_proto::Instance;

    fn idle_instance(id: &str, service_id: &str) -> Instance {
        let mut i = Instance::starting(id.to_string(), service_id.to_string(), id.to_string());
        i.state = PoolState::Idle;
        i
    }

    #[test]
    fn counts_reflect_state_distribution() {
        let cache = PoolCache::new();
        cache.insert(idle_instance("i-1", "svc-1"));
        let mut claimed = idle_instance("i-2", "svc-2");
        claimed.state = PoolState::Claimed;
        cache.insert(claimed);

        let counts = cache.counts();
        assert_eq!(counts.idle, 1);
        assert_eq!(counts.claimed, 1);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn retain_present_drops_absent_services_unless_skipped() {
        let cache = PoolCache::new();
        cache.insert(idle_instance("i-1", "svc-1"));
        cache.insert(idle_instance("i-2", "svc-2"));

        let present: std::collections::HashSet<String> = ["svc-1".to_string()].into_iter().collect();
        cache.retain_present(&present, |sid| sid == "svc-2");
        assert_eq!(cache.len(), 2);

        cache.retain_present(&present, |_| false);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("i-1").is_some());
    }

    #[test]
    fn pick_idle_skips_claim_in_progress() {
        let cache = PoolCache::new();
        cache.insert(idle_instance("i-1", "svc-1"));
        let picked = cache.pick_idle(|sid| sid == "svc-1");
        assert!(picked.is_none());
        let picked = cache.pick_idle(|_| false);
        assert!(picked.is_some());
    }
}
