use serde::{Deserialize, Serialize};

/// Bridge facts as seen by netlink
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeReport {
    pub name: String,
    pub exists: bool,
    pub is_up: bool,
    pub addresses: Vec<String>,
    pub expected_address: Option<String>,
    pub mtu: Option<u32>,
    pub expected_mtu: u32,
    pub ports: Vec<String>,
}

impl BridgeReport {
    pub fn has_gateway(&self) -> bool {
        match &self.expected_address {
            Some(expected) => self.addresses.iter().any(|a| a == expected),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonReport {
    /// A dnsmasq for this bridge shows up in the process table
    pub running: bool,
    /// PID stored on the tenant record
    pub expected_pid: Option<u32>,
    pub pid_file_pid: Option<u32>,
    pub pid_alive: bool,
    pub pid_matches: bool,
    pub config_present: bool,
    pub pid_file_present: bool,
    pub leases_present: bool,
    pub lease_count: usize,
    pub listening_port_67: bool,
    pub log_tail: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysctlValue {
    pub key: String,
    /// `None` when unreadable (module not loaded)
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelReport {
    pub module_loaded: bool,
    pub sysctls: Vec<SysctlValue>,
    pub dropin_present: bool,
    pub autoload_present: bool,
}

impl KernelReport {
    /// All three bridge-nf-call switches read back as 0
    pub fn bridge_nf_disabled(&self) -> bool {
        !self.sysctls.is_empty()
            && self
                .sysctls
                .iter()
                .all(|s| s.value.as_deref() == Some("0"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatReport {
    pub rule_exists: bool,
    pub table_exists: bool,
    pub chain_exists: bool,
    pub forward_rules_exist: bool,
    pub ip_forward_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapReport {
    pub name: String,
    pub carrier: bool,
    pub persist: bool,
    pub owner_pid: Option<u32>,
    pub owner_name: Option<String>,
    pub orphan: bool,
}

/// Full read-only picture of one department's network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub tenant_id: String,
    pub subnet: Option<String>,
    /// The record says this department has a network
    pub configured: bool,
    pub generated_at: i64,
    pub bridge: BridgeReport,
    /// Another department whose record owns the bridge name derived for this one
    #[serde(default)]
    pub bridge_owner: Option<String>,
    pub daemon: DaemonReport,
    pub kernel: KernelReport,
    pub nat: NatReport,
    pub taps: Vec<TapReport>,
    /// Desired and actual state disagree
    pub drifted: bool,
    pub recommendations: Vec<String>,
    pub manual_commands: Vec<String>,
}

impl DiagnosticReport {
    pub fn orphaned_taps(&self) -> usize {
        self.taps.iter().filter(|t| t.orphan).count()
    }
}
