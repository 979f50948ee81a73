//! Pure allocation logic: given a snapshot of domain state and the
//! current hypervisor-free byte count, decide how to redistribute memory.
//!
//! Nothing here touches the hypervisor or the mutex; [`crate::state`]
//! applies whatever this module returns.

use std::collections::HashMap;

use crate::domain::DomainEntry;

/// Captures the operator-tunable preference constants so a config change
/// doesn't require mutable statics.
#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    pub cache_factor: f64,
    pub dom0_mem_boost: u64,
    pub min_prefmem: u64,
}

impl Default for Allocator {
    fn default() -> Self {
        Self {
            cache_factor: crate::constants::CACHE_FACTOR,
            dom0_mem_boost: crate::constants::DOM0_MEM_BOOST,
            min_prefmem: crate::constants::MIN_PREFMEM,
        }
    }
}

impl Allocator {
    /// Preferred memory for a domain with a known `mem_used`. Callers must
    /// only invoke this for eligible domains (see
    /// [`DomainEntry::eligible`]).
    pub fn prefmem(&self, domain: &DomainEntry) -> f64 {
        let mem_used = domain.mem_used.expect("prefmem requires known mem_used") as f64;
        let maximum = domain.mem_maximum as f64;
        if domain.is_privileged() {
            (mem_used * self.cache_factor + self.dom0_mem_boost as f64).min(maximum)
        } else {
            (mem_used * self.cache_factor)
                .min(maximum)
                .max(self.min_prefmem as f64)
        }
    }

    /// `prefmem - mem_actual`. Positive: wants more. Negative: can yield.
    pub fn needed(&self, domain: &DomainEntry) -> f64 {
        self.prefmem(domain) - domain.mem_actual as f64
    }

    /// Requests to satisfy an external ask for `memsize` bytes of
    /// hypervisor-free memory. Returns an empty list if it cannot be
    /// satisfied (including `memsize == 0`, trivially satisfiable but
    /// requiring no donor action).
    pub fn balloon(
        &self,
        memsize: f64,
        domains: &HashMap<String, DomainEntry>,
    ) -> Vec<(String, u64)> {
        if memsize <= 0.0 {
            return Vec::new();
        }

        let mut donors = Vec::new();
        let mut available = 0.0_f64;
        for domain in domains.values() {
            if !domain.eligible() {
                continue;
            }
            let need = self.needed(domain);
            if need < 0.0 {
                donors.push((domain, -need));
                available += -need;
            }
        }

        if available < memsize {
            return Vec::new();
        }

        let scale = memsize / available;
        donors
            .into_iter()
            .map(|(domain, avail_from_donor)| {
                let borrowed =
                    avail_from_donor * scale * crate::constants::BALLOON_SAFETY_FACTOR;
                let target = (domain.mem_actual as f64 - borrowed).max(0.0);
                (domain.id.clone(), target as u64)
            })
            .collect()
    }

    /// Redistribute host-free memory toward every domain's preference.
    /// `free` is hypervisor-free bytes minus the reserve the daemon keeps
    /// aside (may be negative under scarcity).
    ///
    /// Returns donor requests first, acceptor requests second — callers
    /// must apply them in that order so donors release before acceptors
    /// grow.
    pub fn balance(&self, free: f64, domains: &HashMap<String, DomainEntry>) -> Vec<(String, u64)> {
        let mut total_need = 0.0_f64;
        let mut total_pref = 0.0_f64;
        let mut total_pref_acceptors = 0.0_f64;
        let mut donor_ids = Vec::new();
        let mut acceptor_ids = Vec::new();

        for domain in domains.values() {
            if !domain.eligible() {
                continue;
            }
            let need = self.needed(domain);
            let pref = self.prefmem(domain);
            if need < 0.0 || domain.mem_actual >= domain.mem_maximum {
                donor_ids.push(domain.id.clone());
            } else {
                acceptor_ids.push(domain.id.clone());
                total_pref_acceptors += pref;
            }
            total_need += need;
            total_pref += pref;
        }

        let surplus = free - total_need;
        if surplus > 0.0 {
            self.balance_surplus(domains, total_pref, surplus)
        } else {
            self.balance_scarce(domains, free, total_pref_acceptors, &donor_ids, &acceptor_ids)
        }
    }

    fn balance_surplus(
        &self,
        domains: &HashMap<String, DomainEntry>,
        total_pref: f64,
        surplus: f64,
    ) -> Vec<(String, u64)> {
        let mut targets: HashMap<String, f64> = HashMap::new();
        let mut left_memory = 0.0_f64;
        let mut acceptors_count = 0_u64;

        for domain in domains.values() {
            if !domain.eligible() {
                continue;
            }
            let pref = self.prefmem(domain);
            let scale = pref / total_pref;
            let target_nonint = pref + scale * surplus;
            let mut target = crate::constants::BALANCE_SHRINK_FACTOR * target_nonint;
            if target > domain.mem_maximum as f64 {
                left_memory += target - domain.mem_maximum as f64;
                target = domain.mem_maximum as f64;
            } else {
                acceptors_count += 1;
            }
            targets.insert(domain.id.clone(), target);
        }

        while left_memory > 0.0 && acceptors_count > 0 {
            let mut new_left_memory = 0.0_f64;
            let mut new_acceptors_count = acceptors_count;
            for domain in domains.values() {
                if !domain.eligible() {
                    continue;
                }
                let target = *targets.get(&domain.id).unwrap();
                let maximum = domain.mem_maximum as f64;
                if target < maximum {
                    let bonus = crate::constants::BALANCE_SHRINK_FACTOR
                        * (left_memory / acceptors_count as f64);
                    let new_target = if target + bonus >= maximum {
                        new_left_memory += target + bonus - maximum;
                        new_acceptors_count -= 1;
                        maximum
                    } else {
                        target + bonus
                    };
                    targets.insert(domain.id.clone(), new_target);
                }
            }
            left_memory = new_left_memory;
            acceptors_count = new_acceptors_count;
        }

        let mut donors_rq = Vec::new();
        let mut acceptors_rq = Vec::new();
        for domain in domains.values() {
            let Some(&target) = targets.get(&domain.id) else {
                continue;
            };
            let target = target.max(0.0) as u64;
            if (target as f64) < domain.mem_actual as f64 {
                donors_rq.push((domain.id.clone(), target));
            } else {
                acceptors_rq.push((domain.id.clone(), target));
            }
        }
        donors_rq.extend(acceptors_rq);
        donors_rq
    }

    fn balance_scarce(
        &self,
        domains: &HashMap<String, DomainEntry>,
        free: f64,
        total_pref_acceptors: f64,
        donor_ids: &[String],
        acceptor_ids: &[String],
    ) -> Vec<(String, u64)> {
        let mut donors_rq = Vec::new();
        let mut squeezed = free;

        for id in donor_ids {
            let domain = &domains[id];
            let avail = -self.needed(domain);
            if avail < crate::constants::MIN_DONATION as f64 {
                continue;
            }
            squeezed -= avail;
            donors_rq.push((id.clone(), self.prefmem(domain).max(0.0) as u64));
        }

        if squeezed < 0.0 {
            return donors_rq;
        }

        let mut acceptors_rq = Vec::new();
        for id in acceptor_ids {
            let domain = &domains[id];
            let scale = self.prefmem(domain) / total_pref_acceptors;
            let target_nonint = domain.mem_actual as f64 + scale * squeezed;
            let target = (crate::constants::BALANCE_SHRINK_FACTOR * target_nonint)
                .min(domain.mem_maximum as f64)
                .max(0.0) as u64;
            acceptors_rq.push((id.clone(), target));
        }

        donors_rq.extend(acceptors_rq);
        donors_rq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn domain(id: &str, mem_used: u64, mem_max: u64, mem_actual: u64) -> DomainEntry {
        let mut d = DomainEntry::new(id);
        d.mem_used = Some(mem_used);
        d.mem_maximum = mem_max;
        d.mem_current = mem_actual;
        d.last_target = mem_actual;
        d.mem_actual = mem_actual;
        d
    }

    #[test]
    fn prefmem_dom0_gets_boost() {
        let alloc = Allocator::default();
        let dom = domain("0", 1024 * MB, 4096 * MB, 0);
        let pref = alloc.prefmem(&dom);
        assert!((pref - 1681.2 * MB as f64).abs() < 1.0 * MB as f64);
    }

    #[test]
    fn prefmem_domu_has_no_boost_but_has_floor() {
        let alloc = Allocator::default();
        let dom = domain("10", 1024 * MB, 4096 * MB, 0);
        let pref = alloc.prefmem(&dom);
        assert!((pref - 1331.2 * MB as f64).abs() < 1.0 * MB as f64);

        let idle = domain("11", 0, 4096 * MB, 0);
        assert_eq!(alloc.prefmem(&idle) as u64, MIN_PREFMEM_DEFAULT);
    }

    const MIN_PREFMEM_DEFAULT: u64 = 200 * MB;

    #[test]
    fn balloon_zero_is_empty() {
        let alloc = Allocator::default();
        let domains = HashMap::new();
        assert!(alloc.balloon(0.0, &domains).is_empty());
    }

    #[test]
    fn balloon_unsatisfiable_with_no_domains_is_empty() {
        let alloc = Allocator::default();
        let domains = HashMap::new();
        assert!(alloc.balloon(400.0 * MB as f64, &domains).is_empty());
    }

    #[test]
    fn balloon_skips_no_progress_and_unknown_domains() {
        let alloc = Allocator::default();
        let mut domains = HashMap::new();
        domains.insert("0".into(), domain("0", 1024 * MB, 4096 * MB, 1736 * MB));
        let mut dom1 = domain("1", 1024 * MB, 4096 * MB, 1536 * MB);
        dom1.no_progress = true;
        domains.insert("1".into(), dom1);
        let mut dom2 = domain("2", 4096 * MB, 4096 * MB, 4096 * MB);
        dom2.mem_used = None;
        domains.insert("2".into(), dom2);

        let result = alloc.balloon(400.0 * MB as f64, &domains);
        // only dom "0" is eligible and it is not a donor (need > 0)
        assert!(result.is_empty());
    }

    #[test]
    fn balance_surplus_increases_underfull_domain() {
        let alloc = Allocator::default();
        let mut domains = HashMap::new();
        domains.insert("10".into(), domain("10", 1024 * MB, 4096 * MB, 512 * MB));
        let result = alloc.balance(4096.0 * MB as f64, &domains);
        assert_eq!(result.len(), 1);
        let (_, target) = &result[0];
        assert!(*target > 512 * MB);
        assert!(*target <= 4096 * MB);
    }
}
