use crate::utils::constants::{
    DEFAULT_DB_PATH, DEFAULT_DNSMASQ_DIR, DEFAULT_DOMAIN, DEFAULT_MODULES_LOAD,
    DEFAULT_SYSCTL_DROPIN,
};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STOP_GRACE_MS: u64 = 3000;
const DEFAULT_PID_WAIT_MS: u64 = 5000;
const DEFAULT_RESTORE_CONCURRENCY: usize = 4;
const DEFAULT_DNS_SERVERS: &[&str] = &["1.1.1.1", "8.8.8.8"];
const DEFAULT_TAP_PREFIXES: &[&str] = &["tap", "vnet"];
const DEFAULT_HYPERVISORS: &[&str] = &[
    "qemu-system",
    "qemu-kvm",
    "firecracker",
    "cloud-hypervisor",
    "crosvm",
];

/// Runtime configuration of the reconciler and its primitives.
///
/// Every host path is configurable so the whole stack can be pointed at a
/// temporary tree in tests.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub db_path: PathBuf,
    /// Directory holding `<bridge>.conf|.pid|.leases|.log`
    pub dnsmasq_dir: PathBuf,
    pub sysctl_dropin: PathBuf,
    pub modules_load_file: PathBuf,
    pub proc_root: PathBuf,
    pub proc_sys_root: PathBuf,
    pub sys_root: PathBuf,
    pub dnsmasq_bin: String,
    pub tcpdump_bin: String,
    pub iptables_bin: String,
    pub command_timeout: Duration,
    pub stop_grace: Duration,
    pub pid_file_wait: Duration,
    pub tap_prefixes: Vec<String>,
    pub hypervisor_names: Vec<String>,
    pub default_dns_servers: Vec<String>,
    pub default_ntp_servers: Vec<String>,
    pub dhcp_domain: String,
    pub restore_concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            dnsmasq_dir: PathBuf::from(DEFAULT_DNSMASQ_DIR),
            sysctl_dropin: PathBuf::from(DEFAULT_SYSCTL_DROPIN),
            modules_load_file: PathBuf::from(DEFAULT_MODULES_LOAD),
            proc_root: PathBuf::from("/proc"),
            proc_sys_root: PathBuf::from("/proc/sys"),
            sys_root: PathBuf::from("/sys"),
            dnsmasq_bin: "dnsmasq".to_string(),
            tcpdump_bin: "tcpdump".to_string(),
            iptables_bin: "iptables".to_string(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            pid_file_wait: Duration::from_millis(DEFAULT_PID_WAIT_MS),
            tap_prefixes: to_strings(DEFAULT_TAP_PREFIXES),
            hypervisor_names: to_strings(DEFAULT_HYPERVISORS),
            default_dns_servers: to_strings(DEFAULT_DNS_SERVERS),
            default_ntp_servers: Vec::new(),
            dhcp_domain: DEFAULT_DOMAIN.to_string(),
            restore_concurrency: DEFAULT_RESTORE_CONCURRENCY,
        }
    }
}

impl ReconcilerConfig {
    /// Build a config from `DEPTNET_*` environment variables, falling back to defaults.
    ///
    /// Env vars:
    /// - `DEPTNET_DB` (default: `/var/lib/deptnet/deptnet.db`)
    /// - `DEPTNET_DNSMASQ_DIR` (default: `/var/lib/deptnet/dnsmasq`)
    /// - `DEPTNET_SYSCTL_DROPIN`, `DEPTNET_MODULES_LOAD`
    /// - `DEPTNET_PROC_ROOT`, `DEPTNET_PROC_SYS_ROOT`, `DEPTNET_SYS_ROOT`
    /// - `DEPTNET_DNSMASQ_BIN`, `DEPTNET_TCPDUMP_BIN`, `DEPTNET_IPTABLES_BIN`
    /// - `DEPTNET_COMMAND_TIMEOUT_SECS` (default: 30)
    /// - `DEPTNET_STOP_GRACE_MS` (default: 3000)
    /// - `DEPTNET_TAP_PREFIXES`, `DEPTNET_HYPERVISORS` (comma separated)
    /// - `DEPTNET_DNS_SERVERS`, `DEPTNET_NTP_SERVERS` (comma separated)
    /// - `DEPTNET_DHCP_DOMAIN` (default: `dept.local`)
    /// - `DEPTNET_RESTORE_CONCURRENCY` (default: 4)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let restore_concurrency = env_parse("DEPTNET_RESTORE_CONCURRENCY")
            .unwrap_or(defaults.restore_concurrency)
            .max(1);

        Self {
            db_path: env_path("DEPTNET_DB").unwrap_or(defaults.db_path),
            dnsmasq_dir: env_path("DEPTNET_DNSMASQ_DIR").unwrap_or(defaults.dnsmasq_dir),
            sysctl_dropin: env_path("DEPTNET_SYSCTL_DROPIN").unwrap_or(defaults.sysctl_dropin),
            modules_load_file: env_path("DEPTNET_MODULES_LOAD")
                .unwrap_or(defaults.modules_load_file),
            proc_root: env_path("DEPTNET_PROC_ROOT").unwrap_or(defaults.proc_root),
            proc_sys_root: env_path("DEPTNET_PROC_SYS_ROOT").unwrap_or(defaults.proc_sys_root),
            sys_root: env_path("DEPTNET_SYS_ROOT").unwrap_or(defaults.sys_root),
            dnsmasq_bin: std::env::var("DEPTNET_DNSMASQ_BIN").unwrap_or(defaults.dnsmasq_bin),
            tcpdump_bin: std::env::var("DEPTNET_TCPDUMP_BIN").unwrap_or(defaults.tcpdump_bin),
            iptables_bin: std::env::var("DEPTNET_IPTABLES_BIN").unwrap_or(defaults.iptables_bin),
            command_timeout: env_parse("DEPTNET_COMMAND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.command_timeout),
            stop_grace: env_parse("DEPTNET_STOP_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_grace),
            pid_file_wait: defaults.pid_file_wait,
            tap_prefixes: env_list("DEPTNET_TAP_PREFIXES").unwrap_or(defaults.tap_prefixes),
            hypervisor_names: env_list("DEPTNET_HYPERVISORS").unwrap_or(defaults.hypervisor_names),
            default_dns_servers: env_list("DEPTNET_DNS_SERVERS")
                .unwrap_or(defaults.default_dns_servers),
            default_ntp_servers: env_list("DEPTNET_NTP_SERVERS")
                .unwrap_or(defaults.default_ntp_servers),
            dhcp_domain: std::env::var("DEPTNET_DHCP_DOMAIN").unwrap_or(defaults.dhcp_domain),
            restore_concurrency,
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|raw| parse_list(&raw))
}

/// Split a comma separated list, dropping blanks
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
