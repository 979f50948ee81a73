//! Exercises the daemon's externally observable behavior end to end,
//! against the in-memory hypervisor double — no real Xen host required.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use qmemman_daemon::allocator::Allocator;
use qmemman_daemon::hypervisor::fake::FakeHypervisor;
use qmemman_daemon::server::{self, RequestServer};
use qmemman_daemon::state::SystemState;
use qmemman_daemon::watcher::XsWatcher;
use qmemman_shared::QmemmanClient;
use tokio::sync::Mutex;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

async fn new_state(
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

/// Registers a domain in both the fake hypervisor's domain table and the
/// state's tracking, with its meminfo report already applied (which also
/// runs one balance pass as a side effect of `refresh_meminfo`).
async fn add_eligible_domain(
    hv: &FakeHypervisor,
    state: &mut SystemState<FakeHypervisor>,
    id: &str,
    mem_used: u64,
    mem_actual: u64,
    mem_maximum: u64,
) {
    hv.add_domain(id, mem_actual / 1024);
    hv.set_key(
        format!("/local/domain/{id}/memory/static-max"),
        (mem_maximum / 1024).to_string(),
    );
    state.add_domain(id).await.unwrap();
    state.refresh_mem_actual().await.unwrap();
    state
        .refresh_meminfo(id, (mem_used / 1024).to_string().as_bytes())
        .await
        .unwrap();
}

#[tokio::test]
async fn balloon_succeeds_by_shrinking_two_eligible_vms() {
    let dir = tempfile::tempdir().unwrap();
    let hv = Arc::new(FakeHypervisor::new(8 * GB / 1024, 200 * MB / 1024));
    let mut state = new_state(hv.clone(), &dir).await;

    add_eligible_domain(&hv, &mut state, "10", GB, 3 * GB / 2, 4 * GB).await;
    add_eligible_domain(&hv, &mut state, "11", GB, 3 * GB / 2, 4 * GB).await;

    let granted = state.balloon(400.0 * MB as f64).await.unwrap();
    assert!(granted);

    let free = state.free_host_memory().await.unwrap();
    assert!(free as f64 >= 400.0 * MB as f64 + 25.0 * MB as f64 - 1.0);
}

#[tokio::test]
async fn balloon_fails_when_no_vm_can_supply_enough() {
    let dir = tempfile::tempdir().unwrap();
    let hv = Arc::new(FakeHypervisor::new(8 * GB / 1024, 50 * MB / 1024));
    let mut state = new_state(hv.clone(), &dir).await;

    // Each VM is already right at its preference: no surplus to give.
    add_eligible_domain(&hv, &mut state, "10", 200 * MB, (200.0 * MB as f64 * 1.3) as u64, 4 * GB).await;

    let granted = state.balloon(2 * GB as f64).await.unwrap();
    assert!(!granted);
}

#[tokio::test]
async fn malformed_meminfo_leaves_usage_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let hv = Arc::new(FakeHypervisor::new(8 * GB / 1024, GB / 1024));
    let mut state = new_state(hv.clone(), &dir).await;
    hv.add_domain("12", GB / 1024);
    state.add_domain("12").await.unwrap();

    state
        .refresh_meminfo("12", b"MemTotal: 100\nMemFree: 200\n")
        .await
        .unwrap();

    assert_eq!(state.domain_mem_used("12"), None);
}

#[tokio::test]
async fn privileged_domain_gets_cache_boost() {
    // mem_maximum is pinned at the uncapped preference itself, so with
    // plenty of free host memory the surplus-distribution spillover
    // clamps squarely on the boosted preference, not past it.
    let expected = (GB as f64 * 1.3 + 350.0 * MB as f64) as u64;

    let dir = tempfile::tempdir().unwrap();
    let hv = Arc::new(FakeHypervisor::new(8 * GB / 1024, 4 * GB / 1024));
    let mut state = new_state(hv.clone(), &dir).await;
    add_eligible_domain(&hv, &mut state, "0", GB, GB, expected).await;

    state.do_balance().await.unwrap();

    let target_kib: u64 = hv
        .read_key_sync("/local/domain/0/memory/target")
        .and_then(|raw| std::str::from_utf8(&raw).ok().map(str::to_string))
        .and_then(|s| s.parse().ok())
        .unwrap();
    let target_bytes = target_kib * 1024;
    assert!(target_bytes.abs_diff(expected) < 2 * MB);
}

#[tokio::test]
async fn underfull_domain_grows_toward_preference() {
    let dir = tempfile::tempdir().unwrap();
    let hv = Arc::new(FakeHypervisor::new(8 * GB / 1024, 4 * GB / 1024));
    let mut state = new_state(hv.clone(), &dir).await;
    add_eligible_domain(&hv, &mut state, "10", GB, 512 * MB, 4 * GB).await;

    state.do_balance().await.unwrap();

    let new_actual = state.domain_mem_actual("10");
    assert!(new_actual > 512 * MB);
    assert!(new_actual <= 4 * GB);
}

#[tokio::test]
async fn marker_file_suppresses_balance() {
    let dir = tempfile::tempdir().unwrap();
    let hv = Arc::new(FakeHypervisor::new(8 * GB / 1024, 4 * GB / 1024));
    let mut state = new_state(hv.clone(), &dir).await;
    add_eligible_domain(&hv, &mut state, "10", GB, 512 * MB, 4 * GB).await;

    std::fs::write(dir.path().join("do-not-membalance"), "").unwrap();
    state.do_balance().await.unwrap();

    assert_eq!(state.domain_mem_actual("10"), 512 * MB);
}

#[tokio::test]
async fn full_request_cycle_sets_force_reenumerate() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("qmemman.sock");
    let hv = Arc::new(FakeHypervisor::new(8 * GB / 1024, 8 * GB / 1024));
    let state = new_state(hv.clone(), &dir).await;
    let state = Arc::new(Mutex::new(state));
    let force_reenumerate = Arc::new(AtomicBool::new(false));

    let listener = server::bind(&sock_path).unwrap();
    let request_server = RequestServer::new(state.clone(), force_reenumerate.clone());
    tokio::spawn(request_server.run(listener));

    let _watcher = XsWatcher::new(hv, state, force_reenumerate.clone())
        .await
        .unwrap();

    let mut client = QmemmanClient::connect_to(sock_path.to_str().unwrap())
        .await
        .unwrap();
    let granted = client.request_memory(GB).await.unwrap();
    assert!(granted);
    drop(client);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(force_reenumerate.load(Ordering::SeqCst));
}
