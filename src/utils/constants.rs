//! Shared constants for the department network fabric
//!
//! Paths here are defaults only; every one of them can be overridden through
//! `ReconcilerConfig`.

// ============================================================================
// Addressing
// ============================================================================

/// First two octets of the managed allocation pool (`10.10.X.0/24`)
pub const POOL_PREFIX: [u8; 2] = [10, 10];

/// Lowest and highest third octet handed out by the allocator
pub const POOL_MIN_OCTET: u8 = 1;
pub const POOL_MAX_OCTET: u8 = 254;

/// Host offsets of the DHCP pool inside a block
pub const DHCP_RANGE_START_HOST: u32 = 10;
pub const DHCP_RANGE_END_HOST: u32 = 254;

/// Accepted prefix lengths for tenant subnets
pub const MIN_PREFIX_LEN: u8 = 8;
pub const MAX_PREFIX_LEN: u8 = 30;

pub const DEFAULT_MTU: u32 = 1500;

/// Accepted bridge MTU overrides
pub const MIN_MTU: u32 = 576;
pub const MAX_MTU: u32 = 9000;

// ============================================================================
// Naming
// ============================================================================

/// Linux IFNAMSIZ minus the trailing NUL
pub const MAX_IFNAME_LEN: usize = 15;

/// Bridge names are `dept-` plus a short slug of the tenant id
pub const BRIDGE_PREFIX: &str = "dept-";
pub const BRIDGE_SLUG_LEN: usize = 6;

/// Tag placed on every iptables rule so a bridge's rules can be found again
pub const NAT_COMMENT_PREFIX: &str = "deptnet:";

// ============================================================================
// Paths
// ============================================================================

pub const DEFAULT_DB_PATH: &str = "/var/lib/deptnet/deptnet.db";
pub const DEFAULT_DNSMASQ_DIR: &str = "/var/lib/deptnet/dnsmasq";
pub const DEFAULT_SYSCTL_DROPIN: &str = "/etc/sysctl.d/99-deptnet-bridge.conf";
pub const DEFAULT_MODULES_LOAD: &str = "/etc/modules-load.d/deptnet-br_netfilter.conf";

pub const BR_NETFILTER_MODULE: &str = "br_netfilter";

/// The three bridge-netfilter switches, relative to `/proc/sys`
pub const BRIDGE_NF_SYSCTLS: [&str; 3] = [
    "net/bridge/bridge-nf-call-iptables",
    "net/bridge/bridge-nf-call-ip6tables",
    "net/bridge/bridge-nf-call-arptables",
];

pub const IP_FORWARD_SYSCTL: &str = "net/ipv4/ip_forward";

// ============================================================================
// DHCP
// ============================================================================

pub const DHCP_LEASE_TIME: &str = "4h";
pub const DHCP_SERVER_PORT: u16 = 67;
pub const DEFAULT_DOMAIN: &str = "dept.local";

/// Capture window bounds in seconds
pub const MIN_CAPTURE_SECS: u64 = 5;
pub const MAX_CAPTURE_SECS: u64 = 120;
pub const DEFAULT_CAPTURE_SECS: u64 = 30;
