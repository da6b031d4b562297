// Host network primitives for department fabrics
// Netlink bridges, iptables NAT, dnsmasq supervision, bridge-netfilter and TAP cleanup.

pub mod bridge;
pub mod dhcp;
pub mod error;
pub mod kernel;
pub mod nat;
pub mod netlink;
pub mod subnet;
pub mod tap;

pub use bridge::{BridgeManager, BridgeOps};
pub use dhcp::{DhcpConfig, DhcpDaemon, DnsmasqSupervisor};
pub use error::{NetworkError, NetworkResult};
pub use kernel::KernelPrereqs;
pub use nat::{IptablesNat, NatOps};
pub use netlink::{LinkInfo, NetlinkHandle};
pub use subnet::{NetworkClaim, SubnetError, SubnetPlan};
pub use tap::{TapCleanup, TapJanitor};
