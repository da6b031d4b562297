use crate::network::error::{NetworkError, NetworkResult};
use futures::TryStreamExt;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::link::nlas::Nla as LinkNla;
use netlink_packet_route::LinkMessage;
use std::net::Ipv4Addr;

/// Persistent netlink handle wrapping rtnetlink for all bridge and link operations.
/// One handle per process, reused by every tenant.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

/// Facts about one link, as read from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub is_up: bool,
    pub mtu: Option<u32>,
    /// IPv4 addresses in CIDR form
    pub addresses: Vec<String>,
}

impl NetlinkHandle {
    /// Create a new netlink handle with a persistent connection
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    // ── Bridge operations ───────────────────────────────────────────

    /// Create a bridge interface. Idempotent - returns the existing index if present.
    pub async fn create_bridge(&self, name: &str) -> NetworkResult<u32> {
        if let Ok(idx) = self.get_link_index(name).await {
            return Ok(idx);
        }

        let result = self
            .handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await;

        match result {
            Ok(()) => {}
            // Lost a race with another creator
            Err(e) if e.to_string().contains("File exists") => {}
            Err(e) => return Err(NetworkError::Netlink(e)),
        }

        self.get_link_index(name).await
    }

    /// Add an IPv4 address with prefix to a link
    pub async fn add_address(
        &self,
        link_index: u32,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> NetworkResult<()> {
        let result = self
            .handle
            .address()
            .add(link_index, std::net::IpAddr::V4(addr), prefix_len)
            .execute()
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()), // already assigned
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// IPv4 addresses on a link, rendered as `a.b.c.d/len`
    pub async fn list_addresses(&self, link_index: u32) -> NetworkResult<Vec<String>> {
        let mut addresses = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link_index)
            .execute();

        let mut out = Vec::new();
        while let Some(msg) = addresses.try_next().await.map_err(NetworkError::Netlink)? {
            for nla in &msg.nlas {
                if let AddressNla::Address(bytes) = nla {
                    if let Some(ip) = ipv4_from_bytes(bytes) {
                        out.push(format!("{}/{}", ip, msg.header.prefix_len));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Set a link UP by index
    pub async fn set_link_up(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_mtu(&self, index: u32, mtu: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Release a link from its bridge
    pub async fn set_link_nomaster(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .nomaster()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Fetch the raw link message by name. Returns NotFound if the link doesn't exist.
    async fn get_link(&self, name: &str) -> NetworkResult<LinkMessage> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => {
                // rtnetlink returns an error for "not found" on some kernels
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    /// Get a link's ifindex by name
    pub async fn get_link_index(&self, name: &str) -> NetworkResult<u32> {
        self.get_link(name).await.map(|msg| msg.header.index)
    }

    /// Check if a link exists. Errors other than "not found" are propagated.
    pub async fn link_exists(&self, name: &str) -> NetworkResult<bool> {
        match self.get_link(name).await {
            Ok(_) => Ok(true),
            Err(NetworkError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Up-state, MTU and addresses of a link, `None` if it does not exist
    pub async fn link_info(&self, name: &str) -> NetworkResult<Option<LinkInfo>> {
        let msg = match self.get_link(name).await {
            Ok(msg) => msg,
            Err(NetworkError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mtu = msg.nlas.iter().find_map(|nla| match nla {
            LinkNla::Mtu(mtu) => Some(*mtu),
            _ => None,
        });
        let index = msg.header.index;

        Ok(Some(LinkInfo {
            index,
            is_up: msg.header.flags & libc::IFF_UP as u32 != 0,
            mtu,
            addresses: self.list_addresses(index).await?,
        }))
    }

    /// Delete a link by name. Idempotent - returns Ok if link doesn't exist.
    pub async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        let index = match self.get_link_index(name).await {
            Ok(idx) => idx,
            Err(NetworkError::NotFound(_)) => return Ok(()), // already gone
            Err(e) => return Err(e),
        };

        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    // ── Enumeration ─────────────────────────────────────────────────

    /// List all ports (link names) attached to a bridge
    pub async fn list_bridge_ports(&self, bridge_index: u32) -> NetworkResult<Vec<(String, u32)>> {
        let mut links = self.handle.link().get().execute();
        let mut ports = Vec::new();

        while let Some(msg) = links.try_next().await.map_err(NetworkError::Netlink)? {
            let mut name = None;
            let mut is_port = false;

            for nla in &msg.nlas {
                match nla {
                    LinkNla::IfName(n) => name = Some(n.clone()),
                    LinkNla::Master(master_idx) if *master_idx == bridge_index => is_port = true,
                    _ => {}
                }
            }

            if is_port {
                if let Some(n) = name {
                    ports.push((n, msg.header.index));
                }
            }
        }

        Ok(ports)
    }
}

fn ipv4_from_bytes(bytes: &[u8]) -> Option<Ipv4Addr> {
    match bytes {
        [a, b, c, d] => Some(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_from_bytes() {
        assert_eq!(
            ipv4_from_bytes(&[10, 10, 5, 1]),
            Some(Ipv4Addr::new(10, 10, 5, 1))
        );
        assert_eq!(ipv4_from_bytes(&[0; 16]), None);
    }
}
