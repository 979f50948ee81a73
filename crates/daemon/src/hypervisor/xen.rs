//! Real backend, wired to `xenstore` for the key-value store and
//! `xencall` for the two hypercalls qmemman needs. Gated behind the
//! `xen-backend` feature since it links against a Xen toolstack that
//! isn't present on a generic build host.
//!
//! *Targets xenstored's wire protocol and the hypercall ABI current as of
//! Xen 4.17. Other versions are not verified.*

use xencall::XenCall;
use xenstore::client::{XsdClient, XsdInterface};

use super::{DomainInfo, Hypervisor, HypervisorError, HypervisorEvent, PhysInfo};

impl From<xenstore::error::Error> for HypervisorError {
    fn from(err: xenstore::error::Error) -> Self {
        HypervisorError::Transient(err.to_string())
    }
}

impl From<xencall::error::Error> for HypervisorError {
    fn from(err: xencall::error::Error) -> Self {
        HypervisorError::Transient(err.to_string())
    }
}

/// Live connection to xenstored and the privcmd hypercall interface.
pub struct XenHypervisor {
    store: XsdClient,
    call: XenCall,
}

impl XenHypervisor {
    pub async fn connect() -> Result<Self, HypervisorError> {
        let store = XsdClient::open()
            .await
            .map_err(|e| HypervisorError::Transient(e.to_string()))?;
        let call = XenCall::open().map_err(|e| HypervisorError::Transient(e.to_string()))?;
        store.watch("@introduceDomain").await?;
        store.watch("@releaseDomain").await?;
        Ok(Self { store, call })
    }
}

impl Hypervisor for XenHypervisor {
    async fn physical_memory(&self) -> Result<PhysInfo, HypervisorError> {
        let info = self.call.physinfo()?;
        Ok(PhysInfo {
            total_kib: info.total_pages * (info.page_size / 1024),
            free_kib: info.free_pages * (info.page_size / 1024),
        })
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError> {
        let infos = self.call.domain_list()?;
        Ok(infos
            .into_iter()
            .map(|d| DomainInfo {
                id: d.domid.to_string(),
                mem_kib: d.mem_kb,
            })
            .collect())
    }

    async fn list_domain_ids(&self) -> Result<Option<Vec<String>>, HypervisorError> {
        match self.store.list("/local/domain").await {
            Ok(entries) => {
                let mut ids = Vec::with_capacity(entries.len());
                for entry in entries {
                    // Some entries can be stale empty directories left
                    // behind by a crashed toolstack; only count ones with
                    // a live domid key.
                    let domid_key = format!("/local/domain/{entry}/domid");
                    if self.store.read(&domid_key).await.ok().flatten().is_some() {
                        ids.push(entry);
                    }
                }
                Ok(Some(ids))
            }
            Err(_) => Ok(None),
        }
    }

    async fn read_key(&self, path: &str) -> Result<Option<Vec<u8>>, HypervisorError> {
        match self.store.read(path).await {
            Ok(Some(value)) if !value.is_empty() => Ok(Some(value.into_bytes())),
            Ok(_) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn write_key(&self, path: &str, value: &str) -> Result<(), HypervisorError> {
        // Writes raced against a domain's teardown are expected and
        // swallowed by the caller (SystemState::set_mem_target); surface
        // them as Transient so that policy is centralized there.
        self.store
            .write(path, value)
            .await
            .map_err(|e| HypervisorError::Transient(e.to_string()))
    }

    async fn set_domain_memory(
        &self,
        domain_id: &str,
        ceiling_kib: u64,
        target_kib: u64,
    ) -> Result<(), HypervisorError> {
        let domid: u32 = domain_id
            .parse()
            .map_err(|_| HypervisorError::Transient(format!("bad domid {domain_id:?}")))?;
        // Mirrors `xc_domain_setmaxmem` + `xc_domain_set_target_mem`.
        let _ = self.call.domain_set_max_mem(domid, ceiling_kib);
        let _ = self.call.domain_set_target_mem(domid, target_kib);
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<(), HypervisorError> {
        self.store.watch(path).await?;
        Ok(())
    }

    async fn unwatch(&self, path: &str) -> Result<(), HypervisorError> {
        self.store.unwatch(path).await?;
        Ok(())
    }

    async fn next_event(&self) -> Result<HypervisorEvent, HypervisorError> {
        let fired = self.store.read_watch().await?;
        Ok(match fired.as_str() {
            "@introduceDomain" | "@releaseDomain" => HypervisorEvent::DomainListChanged,
            path => {
                let domain_id = path
                    .strip_prefix("/local/domain/")
                    .and_then(|rest| rest.split('/').next())
                    .unwrap_or_default()
                    .to_string();
                HypervisorEvent::Meminfo(domain_id)
            }
        })
    }
}
