//! Per-process memory-balancing state: the live domain table, the
//! preference algorithm, and the hypervisor handle used to read/write it.
//!
//! A single [`SystemState`] is wrapped in `Arc<tokio::sync::Mutex<_>>` by
//! `main` and shared between the request server and the watch loop — every
//! method here assumes the caller already holds that lock for the
//! duration of the call.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::allocator::Allocator;
use crate::constants::{
    AVAIL_MEM_HINT_PATH, DO_NOT_MEMBALANCE_PATH, HOTPLUG_TARGET_ADJUSTMENT, INHIBIT_GROWTH_MARGIN,
    MAXMEM_HEADROOM_KIB, MIN_TOTAL_TRANSFER, MIN_UNDER_PREF_STEP, OVERHEAD_FACTOR,
    XEN_FREE_MINIMUM, XEN_FREE_RESERVE,
};
use crate::domain::DomainEntry;
use crate::hypervisor::{
    hotplug_max_key, static_max_key, target_key, Hypervisor, HypervisorError,
};
use crate::meminfo;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    #[error("i/o error updating daemon state: {0}")]
    Io(#[from] std::io::Error),
}

pub struct SystemState<H: Hypervisor> {
    hv: Arc<H>,
    allocator: Allocator,
    domains: HashMap<String, DomainEntry>,
    /// Fallback ceiling for a domain with neither a hotplug-max nor a
    /// static-max key (in practice, only dom0). Scaled by the same
    /// overhead factor as every other physical-memory reading.
    all_phys_mem: u64,
    avail_mem_hint_path: PathBuf,
    do_not_membalance_path: PathBuf,
}

fn parse_decimal_key(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

impl<H: Hypervisor> SystemState<H> {
    pub async fn new(hv: Arc<H>, allocator: Allocator) -> Result<Self, StateError> {
        Self::with_paths(
            hv,
            allocator,
            AVAIL_MEM_HINT_PATH.into(),
            DO_NOT_MEMBALANCE_PATH.into(),
        )
        .await
    }

    /// Like [`Self::new`], but with the hint-file and marker-file paths
    /// overridden — used by tests so they never touch `/var/run`.
    pub async fn with_paths(
        hv: Arc<H>,
        allocator: Allocator,
        avail_mem_hint_path: PathBuf,
        do_not_membalance_path: PathBuf,
    ) -> Result<Self, StateError> {
        let phys = hv.physical_memory().await?;
        let all_phys_mem = (phys.total_kib as f64 * 1024.0 * OVERHEAD_FACTOR) as u64;
        Ok(Self {
            hv,
            allocator,
            domains: HashMap::new(),
            all_phys_mem,
            avail_mem_hint_path,
            do_not_membalance_path,
        })
    }

    pub fn hypervisor(&self) -> &Arc<H> {
        &self.hv
    }

    pub fn domain_ids(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// A domain's last parsed meminfo usage, or `None` if it has never
    /// reported (or its last report failed validation).
    pub fn domain_mem_used(&self, id: &str) -> Option<u64> {
        self.domains.get(id)?.mem_used
    }

    /// A domain's effective commitment (`max(mem_current, last_target)`),
    /// or `0` if it is not tracked.
    pub fn domain_mem_actual(&self, id: &str) -> u64 {
        self.domains.get(id).map(|d| d.mem_actual).unwrap_or(0)
    }

    pub async fn add_domain(&mut self, id: &str) -> Result<(), StateError> {
        let mut entry = DomainEntry::new(id);
        if let Some(raw) = self.hv.read_key(&target_key(id)).await? {
            if let Some(kib) = parse_decimal_key(&raw) {
                entry.last_target = kib * 1024;
            }
        }
        self.domains.insert(id.to_string(), entry);
        Ok(())
    }

    pub fn remove_domain(&mut self, id: &str) {
        self.domains.remove(id);
    }

    /// Hypervisor-free bytes minus memory already assigned to domains but
    /// not yet used by them. May be negative under scarcity; callers feed
    /// it straight to [`Allocator::balance`].
    pub async fn free_host_memory(&self) -> Result<i64, StateError> {
        let phys = self.hv.physical_memory().await?;
        let xen_free = (phys.free_kib as f64 * 1024.0 * OVERHEAD_FACTOR) as i64;

        let assigned_but_unused: i64 = self
            .domains
            .values()
            .map(|d| (d.last_target as i64 - d.mem_current as i64).max(0))
            .sum();

        if xen_free < XEN_FREE_MINIMUM as i64 {
            tracing::error!(xen_free, assigned_but_unused, "xen free memory below acceptable floor");
        } else if xen_free < assigned_but_unused + XEN_FREE_MINIMUM as i64 {
            tracing::error!(xen_free, assigned_but_unused, "xen free memory too small to satisfy assignments");
        }

        Ok(xen_free - assigned_but_unused)
    }

    /// Re-read every live domain's current allocation and ceiling from the
    /// hypervisor.
    pub async fn refresh_mem_actual(&mut self) -> Result<(), StateError> {
        let infos = self.hv.list_domains().await?;
        for info in infos {
            let Some(dom) = self.domains.get_mut(&info.id) else {
                continue;
            };
            dom.mem_current = info.mem_kib * 1024;
            dom.refresh_actual();

            let hotplug_max = self.hv.read_key(&hotplug_max_key(&info.id)).await?;
            let static_max = self.hv.read_key(&static_max_key(&info.id)).await?;
            if let Some(kib) = hotplug_max.as_deref().and_then(parse_decimal_key) {
                dom.mem_maximum = kib * 1024;
                dom.use_hotplug = true;
            } else if let Some(kib) = static_max.as_deref().and_then(parse_decimal_key) {
                dom.mem_maximum = kib * 1024;
                dom.use_hotplug = false;
            } else {
                // Only dom0 is expected to lack both keys.
                dom.mem_maximum = self.all_phys_mem;
                dom.use_hotplug = false;
            }
        }
        Ok(())
    }

    /// Forgive a domain's past non-cooperation once it has caught up, or
    /// once it is asking for more than it has (so scarcity never starves
    /// it permanently).
    pub fn clear_outdated_error_markers(&mut self) {
        let allocator = self.allocator;
        for dom in self.domains.values_mut() {
            if dom.mem_used.is_none() {
                continue;
            }
            let pref = allocator.prefmem(dom);
            let settled = dom.mem_actual as f64
                <= dom.last_target as f64 + XEN_FREE_RESERVE as f64 / 2.0;
            let under_pref = (dom.mem_actual as f64) < pref;
            if settled || under_pref {
                dom.slow_memset_react = false;
                dom.no_progress = false;
            }
        }
    }

    /// Set a domain's balloon target, in bytes. Propagates the hypervisor
    /// ceiling and target, then republishes the Xen-visible target
    /// (`val` minus the hotplug headroom the guest actually sees).
    pub async fn set_mem_target(&mut self, id: &str, val: u64) -> Result<(), StateError> {
        let Some(dom) = self.domains.get_mut(id) else {
            return Ok(());
        };
        dom.last_target = val;
        dom.refresh_actual();
        let use_hotplug = dom.use_hotplug;

        let target_kib = val / 1024;
        let ceiling_kib = target_kib + MAXMEM_HEADROOM_KIB;
        // Can race a domain mid-shutdown; best-effort like the hypercall
        // it replaces.
        let _ = self.hv.set_domain_memory(id, ceiling_kib, target_kib).await;

        // The guest only sees the ~16 MiB adjustment under hotplug; plain
        // static-max domains get the unadjusted target.
        let written_target_kib = if use_hotplug {
            target_kib.saturating_sub(HOTPLUG_TARGET_ADJUSTMENT / 1024)
        } else {
            target_kib
        };
        self.hv
            .write_key(&target_key(id), &written_target_kib.to_string())
            .await?;
        if use_hotplug {
            self.hv
                .write_key(&static_max_key(id), &target_kib.to_string())
                .await?;
        }
        Ok(())
    }

    /// Called once ballooning has freed enough memory: pull back any
    /// domain whose actual allocation still trails its last target by
    /// more than a small margin, so a later balance pass doesn't
    /// immediately hand that slack back to it.
    async fn inhibit_growth(&mut self) -> Result<(), StateError> {
        let pulled_back: Vec<(String, u64)> = self
            .domains
            .iter()
            .filter(|(_, d)| d.mem_actual + INHIBIT_GROWTH_MARGIN < d.last_target)
            .map(|(id, d)| (id.clone(), d.mem_actual))
            .collect();

        for (id, actual) in pulled_back {
            tracing::info!(dom = %id, target = actual, "preventing balloon up");
            self.set_mem_target(&id, actual).await?;
        }
        Ok(())
    }

    /// Balloon down across all domains until `memsize` additional bytes
    /// are free, or give up. Returns `false` if the request could not be
    /// satisfied (no eligible donors, or donors not making adequate
    /// progress).
    pub async fn balloon(&mut self, memsize: f64) -> Result<bool, StateError> {
        use crate::constants::{BALLOON_DELAY, CHECK_MB_S, CHECK_PERIOD_S};

        let mut niter: usize = 0;
        let mut prev_memory_actual: Option<HashMap<String, u64>> = None;
        for dom in self.domains.values_mut() {
            dom.no_progress = false;
        }

        let check_period = ((CHECK_PERIOD_S / BALLOON_DELAY.as_secs_f64()).floor() as usize).max(1);
        let check_delta = CHECK_PERIOD_S * CHECK_MB_S as f64 * 1024.0 * 1024.0;
        let mut xenfree_ring = vec![0i64; check_period];

        loop {
            self.refresh_mem_actual().await?;
            let xenfree = self.free_host_memory().await?;
            tracing::info!(xenfree, niter, "balloon iteration");

            if xenfree as f64 >= memsize + XEN_FREE_MINIMUM as f64 {
                self.inhibit_growth().await?;
                return Ok(true);
            }

            let ring_slot = niter % check_period;
            if niter >= check_period && (xenfree as f64) < xenfree_ring[ring_slot] as f64 + check_delta {
                return Ok(false);
            }
            xenfree_ring[ring_slot] = xenfree;

            if let Some(prev) = &prev_memory_actual {
                for (id, prev_actual) in prev {
                    if let Some(dom) = self.domains.get_mut(id) {
                        if dom.mem_actual == *prev_actual {
                            dom.no_progress = true;
                            tracing::info!(dom = %id, actual = dom.mem_actual, "stuck, removed from donors");
                        }
                    }
                }
            }

            let target = memsize + XEN_FREE_RESERVE as f64 - xenfree as f64;
            let reqs = self.allocator.balloon(target, &self.domains);
            if reqs.is_empty() {
                return Ok(false);
            }

            let mut next_prev = HashMap::with_capacity(reqs.len());
            for (id, mem) in &reqs {
                self.set_mem_target(id, *mem).await?;
                if let Some(dom) = self.domains.get(id) {
                    next_prev.insert(id.clone(), dom.mem_actual);
                }
            }
            prev_memory_actual = Some(next_prev);

            tokio::time::sleep(BALLOON_DELAY).await;
            niter += 1;
        }
    }

    /// Record a guest's self-reported memory usage and immediately
    /// re-balance. `raw` is untrusted; a malformed report clears
    /// `mem_used` back to unknown rather than keeping a stale value.
    pub async fn refresh_meminfo(&mut self, domain_id: &str, raw: &[u8]) -> Result<(), StateError> {
        if let Some(dom) = self.domains.get_mut(domain_id) {
            dom.mem_used = meminfo::parse(raw);
        }
        self.do_balance().await
    }

    fn total_memory_needed(&self) -> f64 {
        self.domains
            .values()
            .filter(|d| d.eligible())
            .map(|d| self.allocator.needed(d))
            .sum()
    }

    /// Is `reqs` worth acting on, or would it just trash the domains with
    /// a small adjustment?
    fn is_balance_req_significant(&self, reqs: &[(String, u64)], xenfree: i64) -> bool {
        if XEN_FREE_RESERVE as i64 - xenfree > MIN_UNDER_PREF_STEP as i64 {
            return true;
        }

        let mut total_transfer = 0i64;
        for (id, mem) in reqs {
            let Some(dom) = self.domains.get(id) else {
                continue;
            };
            let last_target = dom.last_target as i64;
            let change = *mem as i64 - last_target;
            total_transfer += change.abs();

            let pref = self.allocator.prefmem(dom);
            if last_target > 0 && (last_target as f64) < pref && change as f64 > MIN_UNDER_PREF_STEP as f64 {
                tracing::info!(dom = %id, "below preference, balance is significant");
                return true;
            }
        }

        total_transfer + (xenfree - XEN_FREE_RESERVE as i64).abs() > MIN_TOTAL_TRANSFER as i64
    }

    fn log_balance_stats(&self, xenfree: i64, reqs: &[(String, u64)]) {
        for (id, dom) in &self.domains {
            if dom.mem_used.is_none() {
                continue;
            }
            tracing::info!(
                dom = %id,
                actual = dom.mem_actual,
                pref = self.allocator.prefmem(dom) as u64,
                last_target = dom.last_target,
                no_progress = dom.no_progress,
                slow_memset_react = dom.slow_memset_react,
                "balance stat"
            );
        }
        tracing::info!(xenfree, ?reqs, "balance decision");
    }

    /// Recompute the balance across all domains and apply it. A no-op if
    /// the operator has dropped the do-not-membalance marker file, or if
    /// the computed change is too small to bother with.
    pub async fn do_balance(&mut self) -> Result<(), StateError> {
        if tokio::fs::metadata(&self.do_not_membalance_path).await.is_ok() {
            tracing::debug!("do-not-membalance file present, skipping");
            return Ok(());
        }

        self.refresh_mem_actual().await?;
        self.clear_outdated_error_markers();
        let xenfree = self.free_host_memory().await?;
        let reqs = self
            .allocator
            .balance(xenfree as f64 - XEN_FREE_RESERVE as f64, &self.domains);

        if !self.is_balance_req_significant(&reqs, xenfree) {
            return Ok(());
        }

        self.log_balance_stats(xenfree, &reqs);

        let prev_actual: HashMap<String, u64> = self
            .domains
            .iter()
            .map(|(id, d)| (id.clone(), d.mem_actual))
            .collect();

        for (dom_id, mem) in &reqs {
            if self.wait_for_headroom(dom_id, *mem, &reqs, &prev_actual).await? {
                // Stuck; a fallback target was already applied and the
                // remaining requests in this batch are abandoned.
                break;
            }
            self.set_mem_target(dom_id, *mem).await?;
        }

        self.write_avail_mem_hint().await?;
        Ok(())
    }

    /// Waits until giving `dom_id` its requested target would not push
    /// free memory below the safety margin. Returns `true` if it gave up
    /// after retrying and applied a fallback target instead.
    async fn wait_for_headroom(
        &mut self,
        dom_id: &str,
        mem: u64,
        reqs: &[(String, u64)],
        prev_actual: &HashMap<String, u64>,
    ) -> Result<bool, StateError> {
        use crate::constants::BALLOON_DELAY;

        let mut ntries = 5;
        loop {
            let current_actual = self.domains.get(dom_id).map(|d| d.mem_actual).unwrap_or(0);
            let free_after =
                self.free_host_memory().await? as f64 - (mem as f64 - current_actual as f64);
            if free_after >= 0.9 * XEN_FREE_RESERVE as f64 {
                return Ok(false);
            }

            tracing::debug!(dom = %dom_id, ntries, "waiting for headroom before growing domain");
            tokio::time::sleep(BALLOON_DELAY).await;
            self.refresh_mem_actual().await?;
            ntries -= 1;
            if ntries > 0 {
                continue;
            }

            for (dom2, mem2) in reqs {
                if dom2 == dom_id {
                    break;
                }
                let Some(entry) = self.domains.get_mut(dom2) else {
                    continue;
                };
                if entry.mem_actual as f64 <= entry.last_target as f64 + XEN_FREE_RESERVE as f64 / 4.0 {
                    continue;
                }
                if prev_actual.get(dom2) == Some(&entry.mem_actual) {
                    tracing::warn!(dom = %dom2, held = entry.mem_actual, requested = mem2, "domain did not react to memory request");
                    entry.no_progress = true;
                } else {
                    tracing::warn!(dom = %dom2, held = entry.mem_actual, target = mem2, "domain still holds more memory than assigned");
                    entry.slow_memset_react = true;
                }
            }

            let free_now = self.free_host_memory().await?;
            let actual = self.domains.get(dom_id).map(|d| d.mem_actual).unwrap_or(0);
            let fallback = (free_now as f64 + actual as f64 - XEN_FREE_RESERVE as f64).max(0.0) as u64;
            self.set_mem_target(dom_id, fallback).await?;
            return Ok(true);
        }
    }

    async fn write_avail_mem_hint(&self) -> Result<(), StateError> {
        let xenfree = self.free_host_memory().await?;
        let total_available = xenfree as f64 - XEN_FREE_RESERVE as f64 - self.total_memory_needed();
        let value = total_available.max(0.0) as u64;

        let tmp_path = self.avail_mem_hint_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, value.to_string()).await?;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o644)).await?;
        tokio::fs::rename(&tmp_path, &self.avail_mem_hint_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;

    const MB: u64 = 1024 * 1024;

    async fn state_with(hv: Arc<FakeHypervisor>) -> SystemState<FakeHypervisor> {
        SystemState::new(hv, Allocator::default()).await.unwrap()
    }

    /// For tests that exercise `do_balance` (directly, or via
    /// `refresh_meminfo`), so they never touch `/var/run`.
    async fn state_with_tempdir(
        hv: Arc<FakeHypervisor>,
        dir: &tempfile::TempDir,
    ) -> SystemState<FakeHypervisor> {
        SystemState::with_paths(
            hv,
            Allocator::default(),
            dir.path().join("avail-mem"),
            dir.path().join("do-not-membalance"),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn add_domain_picks_up_existing_target() {
        let hv = Arc::new(FakeHypervisor::new(8192 * 1024, 4096 * 1024));
        hv.set_key("/local/domain/5/memory/target", "524288"); // 512 MiB in KiB
        let mut state = state_with(hv).await;
        state.add_domain("5").await.unwrap();
        assert_eq!(state.domains["5"].last_target, 512 * MB);
    }

    #[tokio::test]
    async fn refresh_mem_actual_falls_back_to_all_phys_mem() {
        let hv = Arc::new(FakeHypervisor::new(8192 * 1024, 4096 * 1024));
        hv.add_domain("0", 1024 * 1024);
        let mut state = state_with(hv).await;
        state.add_domain("0").await.unwrap();
        state.refresh_mem_actual().await.unwrap();
        let dom = &state.domains["0"];
        assert!(!dom.use_hotplug);
        assert!(dom.mem_maximum > 0);
    }

    #[tokio::test]
    async fn balloon_returns_true_when_already_sufficient() {
        let hv = Arc::new(FakeHypervisor::new(8192 * 1024, 8192 * 1024));
        let mut state = state_with(hv).await;
        assert!(state.balloon(0.0).await.unwrap());
    }

    #[tokio::test]
    async fn balloon_fails_with_no_donors() {
        let hv = Arc::new(FakeHypervisor::new(8192 * 1024, 0));
        let mut state = state_with(hv).await;
        assert!(!state.balloon(400.0 * MB as f64).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_meminfo_records_usage_and_rebalances() {
        let dir = tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::new(8192 * 1024, 4096 * 1024));
        hv.add_domain("10", 1024 * 1024);
        let mut state = state_with_tempdir(hv, &dir).await;
        state.add_domain("10").await.unwrap();
        state.refresh_meminfo("10", b"1048576").await.unwrap();
        assert_eq!(state.domains["10"].mem_used, Some(1048576 * 1024));
        assert!(dir.path().join("avail-mem").exists());
    }

    #[tokio::test]
    async fn do_balance_skips_when_marker_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::new(8192 * 1024, 4096 * 1024));
        hv.add_domain("10", 1024 * 1024);
        let mut state = state_with_tempdir(hv, &dir).await;
        state.add_domain("10").await.unwrap();
        std::fs::write(dir.path().join("do-not-membalance"), "").unwrap();
        state.refresh_meminfo("10", b"1048576").await.unwrap();
        assert!(!dir.path().join("avail-mem").exists());
    }
}
