//! Library half of the qmemman daemon: everything except process
//! bootstrap (`main.rs`) lives here so integration tests can drive it
//! directly against [`hypervisor::fake::FakeHypervisor`].

pub mod allocator;
pub mod config;
pub mod constants;
pub mod domain;
pub mod hypervisor;
pub mod meminfo;
pub mod notify;
pub mod server;
pub mod state;
pub mod watcher;
