/// Tracked state for one guest domain.
///
/// Invariant: `mem_actual >= mem_current` and `mem_actual >= last_target`
/// always holds once [`DomainEntry::refresh_actual`] has been called.
#[derive(Debug, Clone)]
pub struct DomainEntry {
    pub id: String,
    /// Guest-reported bytes of "truly used" memory, or unknown until a
    /// valid meminfo report arrives.
    pub mem_used: Option<u64>,
    /// Bytes the hypervisor currently considers allocated to the guest.
    pub mem_current: u64,
    /// Effective commitment: `max(mem_current, last_target)`.
    pub mem_actual: u64,
    /// Upper bound the guest may grow into.
    pub mem_maximum: u64,
    /// Most recent target the daemon set for this guest.
    pub last_target: u64,
    /// True if the guest ignored a shrink request entirely.
    pub no_progress: bool,
    /// True if the guest shrank but remained above target longer than
    /// expected.
    pub slow_memset_react: bool,
    /// True if `mem_maximum` came from a hotplug-max key rather than a
    /// static ceiling.
    pub use_hotplug: bool,
}

/// Domain id of the privileged/host domain; receives a preference boost.
pub const PRIVILEGED_DOMAIN_ID: &str = "0";

impl DomainEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mem_used: None,
            mem_current: 0,
            mem_actual: 0,
            mem_maximum: 0,
            last_target: 0,
            no_progress: false,
            slow_memset_react: false,
            use_hotplug: false,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.id == PRIVILEGED_DOMAIN_ID
    }

    /// Recompute `mem_actual` from the current `mem_current`/`last_target`
    /// pair. Called whenever either changes.
    pub fn refresh_actual(&mut self) {
        self.mem_actual = self.mem_current.max(self.last_target);
    }

    /// Whether this domain participates in donor/acceptor selection this
    /// cycle.
    pub fn eligible(&self) -> bool {
        self.mem_used.is_some() && !self.no_progress
    }
}
