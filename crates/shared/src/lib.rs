pub mod client;
pub mod protocol;

pub use client::{ClientError, QmemmanClient};

/// Default path of the request socket. Mirrors the historical
/// `/var/run/qubes/qmemman.sock` location.
pub const DEFAULT_SOCK_PATH: &str = "/var/run/qubes/qmemman.sock";
