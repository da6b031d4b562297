// Persistence of department network records
// The reconciler is the only writer of the network columns.

pub mod error;
pub mod memory;
pub mod retry;
pub mod schema;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryTenantStore;
pub use sqlite::SqliteTenantStore;

use crate::network::subnet::NetworkClaim;
use crate::utils::constants::DEFAULT_MTU;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One department and the network it was given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantNetworkRecord {
    pub tenant_id: String,
    pub name: String,
    pub subnet: Option<String>,
    pub bridge_name: Option<String>,
    pub gateway_ip: Option<String>,
    pub dhcp_range_start: Option<String>,
    pub dhcp_range_end: Option<String>,
    pub daemon_pid: Option<u32>,
    pub dns_servers: Vec<String>,
    pub ntp_servers: Vec<String>,
    pub mtu: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TenantNetworkRecord {
    pub fn new(tenant_id: &str, name: &str, now: i64) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            subnet: None,
            bridge_name: None,
            gateway_ip: None,
            dhcp_range_start: None,
            dhcp_range_end: None,
            daemon_pid: None,
            dns_servers: Vec::new(),
            ntp_servers: Vec::new(),
            mtu: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A bridge is on record for this department
    pub fn is_configured(&self) -> bool {
        self.bridge_name.is_some()
    }

    pub fn effective_mtu(&self) -> u32 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }

    pub fn claim(&self) -> Option<NetworkClaim> {
        self.subnet.as_ref().map(|subnet| NetworkClaim {
            tenant_id: self.tenant_id.clone(),
            subnet: subnet.clone(),
            bridge_name: self.bridge_name.clone(),
        })
    }
}

/// Partial update of a record. `None` leaves a field untouched; the nested
/// options on nullable fields distinguish "clear" from "keep".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkUpdate {
    pub subnet: Option<String>,
    pub bridge_name: Option<String>,
    pub gateway_ip: Option<String>,
    pub dhcp_range_start: Option<String>,
    pub dhcp_range_end: Option<String>,
    pub daemon_pid: Option<Option<u32>>,
    pub dns_servers: Option<Vec<String>>,
    pub ntp_servers: Option<Vec<String>>,
    pub mtu: Option<Option<u32>>,
}

impl NetworkUpdate {
    pub fn daemon_pid(pid: Option<u32>) -> Self {
        Self {
            daemon_pid: Some(pid),
            ..Default::default()
        }
    }

    pub fn apply(&self, record: &mut TenantNetworkRecord, now: i64) {
        if let Some(subnet) = &self.subnet {
            record.subnet = Some(subnet.clone());
        }
        if let Some(bridge) = &self.bridge_name {
            record.bridge_name = Some(bridge.clone());
        }
        if let Some(gateway) = &self.gateway_ip {
            record.gateway_ip = Some(gateway.clone());
        }
        if let Some(start) = &self.dhcp_range_start {
            record.dhcp_range_start = Some(start.clone());
        }
        if let Some(end) = &self.dhcp_range_end {
            record.dhcp_range_end = Some(end.clone());
        }
        if let Some(pid) = self.daemon_pid {
            record.daemon_pid = pid;
        }
        if let Some(dns) = &self.dns_servers {
            record.dns_servers = dns.clone();
        }
        if let Some(ntp) = &self.ntp_servers {
            record.ntp_servers = ntp.clone();
        }
        if let Some(mtu) = self.mtu {
            record.mtu = mtu;
        }
        record.updated_at = now;
    }
}

/// Drop every network column back to "unconfigured". DHCP settings survive.
pub(crate) fn clear_network_fields(record: &mut TenantNetworkRecord, now: i64) {
    record.subnet = None;
    record.bridge_name = None;
    record.gateway_ip = None;
    record.dhcp_range_start = None;
    record.dhcp_range_end = None;
    record.daemon_pid = None;
    record.updated_at = now;
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, tenant_id: &str) -> StoreResult<Option<TenantNetworkRecord>>;
    /// Fails with `Conflict` when the tenant, subnet or bridge is taken
    async fn insert(&self, record: &TenantNetworkRecord) -> StoreResult<()>;
    /// Returns whether a row was removed
    async fn delete(&self, tenant_id: &str) -> StoreResult<bool>;
    async fn update_network(&self, tenant_id: &str, update: &NetworkUpdate) -> StoreResult<()>;
    async fn clear_network(&self, tenant_id: &str) -> StoreResult<()>;
    /// Every record that has a bridge on file
    async fn list_with_bridge(&self) -> StoreResult<Vec<TenantNetworkRecord>>;
    /// Subnets (and bridge names) currently held by any department
    async fn list_network_claims(&self) -> StoreResult<Vec<NetworkClaim>>;
    async fn list_all(&self) -> StoreResult<Vec<TenantNetworkRecord>>;
}
