//! Abstraction over the hypervisor key-value store and hypercall
//! surface. [`crate::state::SystemState`] and [`crate::watcher::XsWatcher`]
//! are generic over [`Hypervisor`] so they can be driven by an in-memory
//! fake in tests and by the real backend ([`xen`], feature-gated) in
//! production — no network of mocks, just one seam.

#[cfg(feature = "xen-backend")]
pub mod xen;

pub mod fake;

use std::fmt;

/// Total/free physical memory, in kibibytes, as reported by the
/// hypervisor (unscaled by the overhead factor — that scaling is
/// `SystemState`'s job, not the backend's).
#[derive(Debug, Clone, Copy, Default)]
pub struct PhysInfo {
    pub total_kib: u64,
    pub free_kib: u64,
}

/// One entry from the hypervisor's live domain enumeration.
#[derive(Debug, Clone)]
pub struct DomainInfo {
    pub id: String,
    pub mem_kib: u64,
}

/// An event observed on the watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorEvent {
    /// Fired on `@introduceDomain` / `@releaseDomain`.
    DomainListChanged,
    /// Fired on `/local/domain/<id>/memory/meminfo`.
    Meminfo(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    /// Target-set during a domain teardown race, physinfo read during a
    /// momentary hiccup, and similar — expected to clear on the next
    /// iteration. Callers swallow these rather than propagate.
    #[error("transient hypervisor error: {0}")]
    Transient(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The watch channel is closed; nothing further will ever arrive.
    #[error("hypervisor watch channel closed")]
    ChannelClosed,
}

pub fn meminfo_key(domain_id: &str) -> String {
    format!("/local/domain/{domain_id}/memory/meminfo")
}

pub fn target_key(domain_id: &str) -> String {
    format!("/local/domain/{domain_id}/memory/target")
}

pub fn static_max_key(domain_id: &str) -> String {
    format!("/local/domain/{domain_id}/memory/static-max")
}

pub fn hotplug_max_key(domain_id: &str) -> String {
    format!("/local/domain/{domain_id}/memory/hotplug-max")
}

/// Narrow seam over the hypervisor: enumerate/read/write the key-value
/// store, receive watch events, and issue the two hypercalls qmemman
/// needs (read physinfo, set a domain's memory ceiling + target).
///
/// Generic bound rather than a trait object: both call sites
/// (`SystemState`, `XsWatcher`) know their concrete backend at
/// construction time, so there is no need to pay for dynamic dispatch or
/// fight async-fn-in-dyn-trait limitations.
pub trait Hypervisor: Send + Sync + 'static {
    /// Read total/free physical memory, unscaled.
    fn physical_memory(
        &self,
    ) -> impl std::future::Future<Output = Result<PhysInfo, HypervisorError>> + Send;

    /// Enumerate every live domain and its current `mem_kb`.
    fn list_domains(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<DomainInfo>, HypervisorError>> + Send;

    /// List live domain ids under `/local/domain`. Returns `None` if the
    /// enumeration is empty/absent (a transient hypervisor hiccup, not a
    /// real "no domains" state).
    fn list_domain_ids(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<Vec<String>>, HypervisorError>> + Send;

    /// Read a key's raw bytes. `None` if missing or empty.
    fn read_key(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, HypervisorError>> + Send;

    /// Write a key's value (ASCII decimal, in practice).
    fn write_key(
        &self,
        path: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<(), HypervisorError>> + Send;

    /// Set a domain's memory ceiling and balloon target, both in
    /// kibibytes.
    fn set_domain_memory(
        &self,
        domain_id: &str,
        ceiling_kib: u64,
        target_kib: u64,
    ) -> impl std::future::Future<Output = Result<(), HypervisorError>> + Send;

    /// Subscribe to a key. Idempotent.
    fn watch(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = Result<(), HypervisorError>> + Send;

    /// Drop a subscription. Idempotent.
    fn unwatch(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = Result<(), HypervisorError>> + Send;

    /// Block until the next watched event fires.
    fn next_event(
        &self,
    ) -> impl std::future::Future<Output = Result<HypervisorEvent, HypervisorError>> + Send;
}

impl fmt::Display for HypervisorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HypervisorEvent::DomainListChanged => write!(f, "domain-list-changed"),
            HypervisorEvent::Meminfo(id) => write!(f, "meminfo({id})"),
        }
    }
}
