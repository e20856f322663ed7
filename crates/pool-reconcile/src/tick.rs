//! The reconciler tick (§4.3). One tick is a single, ordered pass: list,
//! filter, probe, derive, rewrite, prune, delete, replenish.

use crate::Reconciler;
use chrono::Utc;
use futures_util::future::join_all;
use pool_proto::{Instance, PoolState, ServiceListing};
use pool_status::{derive_state, promote_crashed_if_claimed};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default, serde::Serialize)]
pub struct TickOutcome {
    pub short_circuited: bool,
    pub probed: usize,
    pub rewritten_crashed: usize,
    pub pruned: usize,
    pub deletes_attempted: usize,
    pub created: usize,
}

impl Reconciler {
    pub async fn tick(self: &Arc<Self>) -> TickOutcome {
        self.metrics.ticks_total.inc();
        let mut outcome = TickOutcome::default();

        // Step 1: list services. Never take destructive action on a
        // partial view.
        let Some(services) = self.provider.list_services().await else {
            self.metrics.ticks_short_circuited.inc();
            outcome.short_circuited = true;
            warn!("provider listing unavailable, skipping tick");
            return outcome;
        };

        // Step 2: filter to in-scope services.
        let own_service_name = format!("{}manager-{}", self.settings.pool_prefix, self.settings.environment_tag);
        let in_scope: Vec<ServiceListing> = services
            .into_iter()
            .filter(|s| {
                s.name.starts_with(&self.settings.pool_prefix)
                    && s.environment_id == self.settings.provider_environment_id
                    && s.name != own_service_name
            })
            .collect();

        // Step 3: metadata index keyed by service id.
        let metadata_by_service = self.store.index_by_service_id();

        // Step 4: resolve public URLs and probe in-scope SUCCESS services
        // in parallel with a settle-all combinator; each probe's failure is
        // isolated to that service. `resolved_urls` carries every URL this
        // pass resolved (whether or not the gateway answered) so step 5 can
        // persist it into the cache entry instead of re-resolving forever.
        let (probes, resolved_urls) = self.probe_all(&in_scope).await;
        outcome.probed = probes.len();

        // Step 5: derive state per service, skipping claim-in-progress ids.
        let mut scheduled_deletes = Vec::new();
        let mut present_ids: HashSet<String> = HashSet::new();

        for service in &in_scope {
            present_ids.insert(service.service_id.clone());
            if self.claim_guard.contains(&service.service_id) {
                continue;
            }

            let age = Utc::now() - service.created_at;
            let probe = probes.get(&service.service_id);
            let deploy_status = service.deploy_status.unwrap_or(pool_proto::DeployStatus::Unknown);
            let stuck_timeout = chrono::Duration::from_std(self.settings.stuck_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(pool_status::DEFAULT_STUCK_TIMEOUT_SECS));
            let state = derive_state(deploy_status, probe, age, stuck_timeout);
            let has_metadata = metadata_by_service.contains_key(&service.service_id);
            let state = promote_crashed_if_claimed(state, has_metadata);

            match state {
                PoolState::Dead | PoolState::Sleeping if has_metadata => {
                    outcome.rewritten_crashed += 1;
                    self.metrics.crashed_detected.inc();
                    let row = &metadata_by_service[&service.service_id];
                    let mut entry = self
                        .cache
                        .find_by_service_id(&service.service_id)
                        .unwrap_or_else(|| Instance::starting(row.instance_id.clone(), service.service_id.clone(), service.name.clone()));
                    entry.state = PoolState::Crashed;
                    entry.deploy_status = deploy_status;
                    entry.enrich_from_metadata(row);
                    self.cache.insert(entry);
                }
                PoolState::Dead | PoolState::Sleeping => {
                    // No metadata row: a silent-delete candidate, but only
                    // once it has outlived the orphan grace period — a
                    // service can briefly show dead/sleeping right after
                    // creation, before its metadata row and deploy both land.
                    let orphan_grace = chrono::Duration::from_std(self.settings.orphan_grace)
                        .unwrap_or_else(|_| chrono::Duration::seconds(10 * 60));
                    if age >= orphan_grace {
                        if let Some(existing) = self.cache.find_by_service_id(&service.service_id) {
                            self.cache.remove(&existing.id);
                        }
                        scheduled_deletes.push(service.service_id.clone());
                    }
                }
                _ => {
                    let existing = self.cache.find_by_service_id(&service.service_id);
                    let instance_id = existing.as_ref().map(|i| i.id.clone()).unwrap_or_else(crate::generate_instance_id);
                    let mut entry = existing.unwrap_or_else(|| {
                        Instance::starting(instance_id.clone(), service.service_id.clone(), service.name.clone())
                    });
                    entry.state = state;
                    entry.deploy_status = deploy_status;
                    entry.created_at = service.created_at;
                    if let Some(url) = resolved_urls.get(&service.service_id) {
                        entry.public_url = Some(url.clone());
                    }
                    if let Some(row) = metadata_by_service.get(&service.service_id) {
                        entry.enrich_from_metadata(row);
                    }
                    self.cache.insert(entry);
                }
            }
        }

        // Step 6: prune cache entries whose service no longer appears.
        let before = self.cache.len();
        self.cache.retain_present(&present_ids, |sid| self.claim_guard.contains(sid));
        outcome.pruned = before.saturating_sub(self.cache.len());

        // Step 7: execute scheduled deletes; isolate failures.
        outcome.deletes_attempted = scheduled_deletes.len();
        for service_id in scheduled_deletes {
            if let Err(e) = self.provider.delete_service(&service_id).await {
                warn!(service_id, error = %e, "scheduled delete failed, will retry next tick");
            } else {
                self.metrics.orphans_deleted.inc();
            }
        }

        // Step 8: replenish up to the deficit, bounded by MAX_TOTAL, unless
        // the circuit breaker is open.
        let counts = self.cache.counts();
        let total = counts.total();
        let deficit = self.settings.min_idle.saturating_sub(counts.idle + counts.starting);
        if deficit > 0 {
            let room = self.settings.max_total.saturating_sub(total);
            let to_create = deficit.min(room);
            if to_create > 0 {
                if self.breaker.lock().allow_create() {
                    for _ in 0..to_create {
                        let this = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(e) = this.create_instance().await {
                                warn!(error = %e, "replenish create failed");
                            }
                        });
                        outcome.created += 1;
                    }
                } else {
                    info!(deficit, "circuit breaker open, suppressing replenish this tick");
                }
            }
        }

        info!(
            probed = outcome.probed,
            crashed = outcome.rewritten_crashed,
            pruned = outcome.pruned,
            created = outcome.created,
            "tick complete"
        );
        outcome
    }

    /// Resolve a public URL for, and probe, every in-scope `SUCCESS`
    /// service. Returns the probe results keyed by service id alongside
    /// every URL resolved along the way, so a caller can persist the URL
    /// into the cache even for services whose gateway didn't answer.
    async fn probe_all(
        &self,
        in_scope: &[ServiceListing],
    ) -> (HashMap<String, pool_proto::ProbeResult>, HashMap<String, String>) {
        let success_services: Vec<&ServiceListing> = in_scope
            .iter()
            .filter(|s| s.deploy_status == Some(pool_proto::DeployStatus::Success))
            .collect();

        let futures = success_services.iter().map(|service| async move {
            let url = self.resolve_public_url_for_probe(service).await?;
            let probe = self.gateway.status(&url).await;
            Some((service.service_id.clone(), url, probe))
        });

        let mut probes = HashMap::new();
        let mut resolved_urls = HashMap::new();
        for (service_id, url, probe) in join_all(futures).await.into_iter().flatten() {
            resolved_urls.insert(service_id.clone(), url);
            if let Some(probe) = probe {
                probes.insert(service_id, probe);
            }
        }
        (probes, resolved_urls)
    }

    async fn resolve_public_url_for_probe(&self, service: &ServiceListing) -> Option<String> {
        if let Some(cached) = self.cache.find_by_service_id(&service.service_id).and_then(|i| i.public_url) {
            return Some(cached);
        }
        self.resolve_public_url(&service.service_id).await.ok()
    }
}
