// Bridge lifecycle primitives
// Per-department Linux bridges: create, address, MTU, ports, teardown.

use crate::network::error::NetworkResult;
use crate::network::netlink::{LinkInfo, NetlinkHandle};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Bridge/link primitives consumed by the reconciler.
///
/// Deletions are idempotent: removing something already gone is `Ok`.
#[async_trait]
pub trait BridgeOps: Send + Sync {
    /// Create the bridge with the given MTU and bring it up
    async fn create_bridge(&self, name: &str, mtu: u32) -> NetworkResult<()>;
    async fn delete_bridge(&self, name: &str) -> NetworkResult<()>;
    async fn bridge_exists(&self, name: &str) -> NetworkResult<bool>;
    async fn assign_address(&self, name: &str, addr: Ipv4Addr, prefix_len: u8)
        -> NetworkResult<()>;
    async fn set_mtu(&self, name: &str, mtu: u32) -> NetworkResult<()>;
    /// Names of every link enslaved to the bridge
    async fn list_ports(&self, name: &str) -> NetworkResult<Vec<String>>;
    async fn detach_port(&self, port: &str) -> NetworkResult<()>;
    async fn delete_link(&self, name: &str) -> NetworkResult<()>;
    async fn link_info(&self, name: &str) -> NetworkResult<Option<LinkInfo>>;
}

/// Netlink-backed bridge manager shared by all tenants
pub struct BridgeManager {
    nl: Arc<NetlinkHandle>,
}

impl BridgeManager {
    pub fn new(nl: Arc<NetlinkHandle>) -> Self {
        Self { nl }
    }
}

#[async_trait]
impl BridgeOps for BridgeManager {
    async fn create_bridge(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        let index = self.nl.create_bridge(name).await?;
        self.nl.set_link_mtu(index, mtu).await?;
        self.nl.set_link_up(index).await?;
        tracing::info!("Bridge {} created (ifindex {}, mtu {})", name, index, mtu);
        Ok(())
    }

    async fn delete_bridge(&self, name: &str) -> NetworkResult<()> {
        self.nl.delete_link(name).await
    }

    async fn bridge_exists(&self, name: &str) -> NetworkResult<bool> {
        self.nl.link_exists(name).await
    }

    async fn assign_address(
        &self,
        name: &str,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> NetworkResult<()> {
        let index = self.nl.get_link_index(name).await?;
        self.nl.add_address(index, addr, prefix_len).await
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        let index = self.nl.get_link_index(name).await?;
        self.nl.set_link_mtu(index, mtu).await
    }

    async fn list_ports(&self, name: &str) -> NetworkResult<Vec<String>> {
        let index = self.nl.get_link_index(name).await?;
        let ports = self.nl.list_bridge_ports(index).await?;
        Ok(ports.into_iter().map(|(port, _)| port).collect())
    }

    async fn detach_port(&self, port: &str) -> NetworkResult<()> {
        let index = self.nl.get_link_index(port).await?;
        self.nl.set_link_nomaster(index).await
    }

    async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        self.nl.delete_link(name).await
    }

    async fn link_info(&self, name: &str) -> NetworkResult<Option<LinkInfo>> {
        self.nl.link_info(name).await
    }
}
