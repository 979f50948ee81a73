//! Tuning constants. Three of these (`CACHE_FACTOR`, `DOM0_MEM_BOOST`,
//! `MIN_PREFMEM`) are defaults only — [`crate::config::Config`] can
//! override them from the `[global]` INI section. The rest are not
//! operator-tunable.

/// Multiplier applied over a domain's reported "truly used" memory to
/// form its preferred allocation.
pub const CACHE_FACTOR: f64 = 1.3;

/// Floor for non-privileged domains' preferred memory.
pub const MIN_PREFMEM: u64 = 200 * 1024 * 1024;

/// Additive bonus applied to the privileged domain's preference, to keep
/// its disk cache generous.
pub const DOM0_MEM_BOOST: u64 = 350 * 1024 * 1024;

/// Safety factor applied when computing how much to ask a donor to
/// release during ballooning, to absorb rounding losses.
pub const BALLOON_SAFETY_FACTOR: f64 = 1.05;

/// Shrink factor applied before integer truncation in the balance
/// algorithm, so rounding never pushes the sum of targets above free.
pub const BALANCE_SHRINK_FACTOR: f64 = 0.999;

/// Donors with less than this much surplus are assumed to have already
/// converged and are skipped during scarcity-regime balancing.
pub const MIN_DONATION: u64 = 10 * 1024 * 1024;

/// Hypervisor-side reserve the daemon keeps unallocated as a working
/// buffer.
pub const XEN_FREE_RESERVE: u64 = 50 * 1024 * 1024;

/// Floor below which free hypervisor memory is a failure of the daemon
/// itself, logged prominently.
pub const XEN_FREE_MINIMUM: u64 = 25 * 1024 * 1024;

/// Delay between iterations of the ballooning and balancing loops.
pub const BALLOON_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Overhead of per-page hypervisor structures; total/free physical memory
/// is scaled by this factor to get "assignable" memory. Taken from
/// OpenStack's nova/virt/xenapi driver, see
/// <https://wiki.openstack.org/wiki/XenServer/Overhead>.
pub const OVERHEAD_FACTOR: f64 = 1.0 / 1.00781;

/// Window, in seconds, over which `do_balloon` measures its rate of
/// progress.
pub const CHECK_PERIOD_S: f64 = 3.0;

/// Minimum acceptable rate of progress during ballooning, in MiB/s.
pub const CHECK_MB_S: u64 = 100;

/// Minimum total byte transfer (across all requests, plus the reserve
/// shortfall) worth acting on in `do_balance`'s significance filter.
pub const MIN_TOTAL_TRANSFER: u64 = 150 * 1024 * 1024;

/// Minimum increase, for a domain currently below its preference, that
/// forces `do_balance` to act even if the total transfer is small.
pub const MIN_UNDER_PREF_STEP: u64 = 15 * 1024 * 1024;

/// `memory/target` is republished this many bytes lower than the actual
/// target when a domain uses memory hotplug, since the guest then sees
/// about 16 MiB less than the hypervisor grants it.
pub const HOTPLUG_TARGET_ADJUSTMENT: u64 = 16 * 1024 * 1024;

/// Constant added above a domain's target when setting its memory
/// ceiling, matching Xen's `LIBXL_MAXMEM_CONSTANT`.
pub const MAXMEM_HEADROOM_KIB: u64 = 1024;

/// Margin used by `inhibit_growth`: a domain is only pulled back down if
/// its actual allocation trails its last target by more than this.
pub const INHIBIT_GROWTH_MARGIN: u64 = 200 * 1024;

/// Default path of the request socket.
pub const DEFAULT_SOCK_PATH: &str = qmemman_shared::DEFAULT_SOCK_PATH;

/// Default path of the daemon's own config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/qubes/qmemman.conf";

/// Presence of this file suppresses `do_balance` entirely.
pub const DO_NOT_MEMBALANCE_PATH: &str = "/var/run/qubes/do-not-membalance";

/// Hint file updated after every successful balance with the remaining
/// surplus, for out-of-process consumers.
pub const AVAIL_MEM_HINT_PATH: &str = "/var/run/qubes/qmemman-available-memory";
