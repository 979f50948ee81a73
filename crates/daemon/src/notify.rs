//! Thin wrapper around systemd's service-readiness protocol. A no-op
//! outside of a systemd-managed service (no `NOTIFY_SOCKET` in the
//! environment), matching systemd's own "notify is always safe to call"
//! contract.

/// Tell systemd the daemon has finished binding its socket and is ready
/// to serve requests. Honors the abstract-namespace `@` convention for
/// `NOTIFY_SOCKET`, same as every other sd_notify caller.
pub fn notify_ready() {
    match sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        Ok(()) => tracing::debug!("notified systemd of readiness"),
        Err(err) => tracing::debug!(error = %err, "sd_notify unavailable, skipping"),
    }
}
