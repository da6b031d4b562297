use crate::network::subnet::NetworkClaim;
use crate::store::error::{StoreError, StoreResult};
use crate::store::{clear_network_fields, NetworkUpdate, TenantNetworkRecord, TenantStore};
use crate::utils::process::ProcessUtils;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Process-local store with the same uniqueness rules as the SQLite schema
#[derive(Default)]
pub struct MemoryTenantStore {
    records: RwLock<BTreeMap<String, TenantNetworkRecord>>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_unique(
        records: &BTreeMap<String, TenantNetworkRecord>,
        candidate: &TenantNetworkRecord,
    ) -> StoreResult<()> {
        for other in records.values().filter(|r| r.tenant_id != candidate.tenant_id) {
            if candidate.subnet.is_some() && other.subnet == candidate.subnet {
                return Err(StoreError::Conflict {
                    message: format!(
                        "subnet {:?} already stored for {}",
                        candidate.subnet, other.tenant_id
                    ),
                });
            }
            if candidate.bridge_name.is_some() && other.bridge_name == candidate.bridge_name {
                return Err(StoreError::Conflict {
                    message: format!(
                        "bridge {:?} already stored for {}",
                        candidate.bridge_name, other.tenant_id
                    ),
                });
            }
        }
        Ok(())
    }

    fn modify<F>(&self, tenant_id: &str, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut TenantNetworkRecord),
    {
        let mut records = self.records.write();
        let mut record = records
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                tenant_id: tenant_id.to_string(),
            })?;
        change(&mut record);
        Self::check_unique(&records, &record)?;
        records.insert(tenant_id.to_string(), record);
        Ok(())
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn get(&self, tenant_id: &str) -> StoreResult<Option<TenantNetworkRecord>> {
        Ok(self.records.read().get(tenant_id).cloned())
    }

    async fn insert(&self, record: &TenantNetworkRecord) -> StoreResult<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.tenant_id) {
            return Err(StoreError::Conflict {
                message: format!("department {} already exists", record.tenant_id),
            });
        }
        Self::check_unique(&records, record)?;
        records.insert(record.tenant_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, tenant_id: &str) -> StoreResult<bool> {
        Ok(self.records.write().remove(tenant_id).is_some())
    }

    async fn update_network(&self, tenant_id: &str, update: &NetworkUpdate) -> StoreResult<()> {
        let now = ProcessUtils::get_timestamp();
        self.modify(tenant_id, |record| update.apply(record, now))
    }

    async fn clear_network(&self, tenant_id: &str) -> StoreResult<()> {
        let now = ProcessUtils::get_timestamp();
        self.modify(tenant_id, |record| clear_network_fields(record, now))
    }

    async fn list_with_bridge(&self) -> StoreResult<Vec<TenantNetworkRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.bridge_name.is_some())
            .cloned()
            .collect())
    }

    async fn list_network_claims(&self) -> StoreResult<Vec<NetworkClaim>> {
        Ok(self
            .records
            .read()
            .values()
            .filter_map(TenantNetworkRecord::claim)
            .collect())
    }

    async fn list_all(&self) -> StoreResult<Vec<TenantNetworkRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }
}
