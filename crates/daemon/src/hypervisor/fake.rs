//! In-memory hypervisor double used by unit and integration tests. Models
//! just enough of xenstore/xenctrl semantics to drive `SystemState` and
//! `XsWatcher` without a real Xen host: a key tree, a domain table, and a
//! FIFO of pending watch events.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::{DomainInfo, Hypervisor, HypervisorError, HypervisorEvent, PhysInfo};

struct Inner {
    keys: HashMap<String, Vec<u8>>,
    domains: HashMap<String, u64>,
    phys: PhysInfo,
    events: VecDeque<HypervisorEvent>,
    watched: std::collections::HashSet<String>,
}

/// Cheap to clone; all instances share the same underlying state via
/// `Arc` internally held by the test that constructs one.
pub struct FakeHypervisor {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl FakeHypervisor {
    pub fn new(total_kib: u64, free_kib: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                keys: HashMap::new(),
                domains: HashMap::new(),
                phys: PhysInfo {
                    total_kib,
                    free_kib,
                },
                events: VecDeque::new(),
                watched: std::collections::HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn set_free_kib(&self, free_kib: u64) {
        self.inner.lock().unwrap().phys.free_kib = free_kib;
    }

    pub fn free_kib(&self) -> u64 {
        self.inner.lock().unwrap().phys.free_kib
    }

    pub fn add_domain(&self, id: &str, mem_kib: u64) {
        self.inner.lock().unwrap().domains.insert(id.to_string(), mem_kib);
        self.push_event(HypervisorEvent::DomainListChanged);
    }

    pub fn remove_domain(&self, id: &str) {
        self.inner.lock().unwrap().domains.remove(id);
        self.push_event(HypervisorEvent::DomainListChanged);
    }

    pub fn set_domain_mem_kib(&self, id: &str, mem_kib: u64) {
        if let Some(v) = self.inner.lock().unwrap().domains.get_mut(id) {
            *v = mem_kib;
        }
    }

    pub fn set_key(&self, path: &str, value: impl Into<Vec<u8>>) {
        self.inner.lock().unwrap().keys.insert(path.to_string(), value.into());
    }

    pub fn fire_meminfo(&self, domain_id: &str, raw: impl Into<Vec<u8>>) {
        self.set_key(&super::meminfo_key(domain_id), raw);
        self.push_event(HypervisorEvent::Meminfo(domain_id.to_string()));
    }

    pub fn read_key_sync(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().keys.get(path).cloned()
    }

    fn push_event(&self, event: HypervisorEvent) {
        self.inner.lock().unwrap().events.push_back(event);
        self.notify.notify_one();
    }
}

impl Hypervisor for FakeHypervisor {
    async fn physical_memory(&self) -> Result<PhysInfo, HypervisorError> {
        Ok(self.inner.lock().unwrap().phys)
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .domains
            .iter()
            .map(|(id, mem_kib)| DomainInfo {
                id: id.clone(),
                mem_kib: *mem_kib,
            })
            .collect())
    }

    async fn list_domain_ids(&self) -> Result<Option<Vec<String>>, HypervisorError> {
        let inner = self.inner.lock().unwrap();
        if inner.domains.is_empty() {
            return Ok(Some(Vec::new()));
        }
        Ok(Some(inner.domains.keys().cloned().collect()))
    }

    async fn read_key(&self, path: &str) -> Result<Option<Vec<u8>>, HypervisorError> {
        Ok(self.inner.lock().unwrap().keys.get(path).cloned())
    }

    async fn write_key(&self, path: &str, value: &str) -> Result<(), HypervisorError> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .insert(path.to_string(), value.as_bytes().to_vec());
        Ok(())
    }

    async fn set_domain_memory(
        &self,
        domain_id: &str,
        _ceiling_kib: u64,
        target_kib: u64,
    ) -> Result<(), HypervisorError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mem) = inner.domains.get_mut(domain_id) {
            *mem = target_kib;
        }
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<(), HypervisorError> {
        self.inner.lock().unwrap().watched.insert(path.to_string());
        Ok(())
    }

    async fn unwatch(&self, path: &str) -> Result<(), HypervisorError> {
        self.inner.lock().unwrap().watched.remove(path);
        Ok(())
    }

    async fn next_event(&self) -> Result<HypervisorEvent, HypervisorError> {
        loop {
            if let Some(event) = self.inner.lock().unwrap().events.pop_front() {
                return Ok(event);
            }
            self.notify.notified().await;
        }
    }
}
