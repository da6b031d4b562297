// Hand-written fakes for the primitive seams
// Each fake records the calls it receives so tests can assert on OS traffic.

use crate::config::ReconcilerConfig;
use crate::diagnostics::capture::{CaptureResult, CaptureSummary, TrafficCapture};
use crate::diagnostics::report::{DaemonReport, NatReport};
use crate::network::bridge::BridgeOps;
use crate::network::dhcp::{DhcpConfig, DhcpDaemon};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::nat::NatOps;
use crate::network::netlink::LinkInfo;
use crate::reconciler::Fabric;
use crate::utils::command::{render, CommandResult, CommandRunner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Script = dyn Fn(&str, &[&str]) -> CommandResult + Send + Sync;

/// Command runner answering from a closure
pub struct ScriptedRunner {
    script: Box<Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, &[&str]) -> CommandResult + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every command exits 0 with no output
    pub fn ok() -> Self {
        Self::new(|_, _| CommandResult::from_exit(0, "", ""))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> NetworkResult<CommandResult> {
        self.calls.lock().push(render(program, args));
        Ok((self.script)(program, args))
    }
}

/// Config with every host path under `dir`
pub fn config_in(dir: &Path) -> ReconcilerConfig {
    ReconcilerConfig {
        db_path: dir.join("deptnet.db"),
        dnsmasq_dir: dir.join("dnsmasq"),
        sysctl_dropin: dir.join("etc/sysctl.d/99-deptnet-bridge.conf"),
        modules_load_file: dir.join("etc/modules-load.d/deptnet-br_netfilter.conf"),
        proc_root: dir.join("proc"),
        proc_sys_root: dir.join("proc/sys"),
        sys_root: dir.join("sys"),
        dnsmasq_bin: "dnsmasq".to_string(),
        stop_grace: Duration::from_millis(100),
        pid_file_wait: Duration::from_millis(300),
        ..ReconcilerConfig::default()
    }
}

fn simulated(what: &str) -> NetworkError {
    NetworkError::Command {
        cmd: what.to_string(),
        stderr: "simulated failure".to_string(),
    }
}

#[derive(Debug, Clone)]
struct FakeLink {
    index: u32,
    is_bridge: bool,
    up: bool,
    mtu: u32,
    addresses: Vec<String>,
    master: Option<String>,
}

/// In-memory link table
#[derive(Default)]
pub struct FakeBridgeOps {
    links: Mutex<BTreeMap<String, FakeLink>>,
    next_index: AtomicU32,
    fail_delete: Mutex<HashSet<String>>,
    fail_create: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeBridgeOps {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn add_link(&self, name: &str, is_bridge: bool, master: Option<&str>) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        self.links.lock().insert(
            name.to_string(),
            FakeLink {
                index,
                is_bridge,
                up: true,
                mtu: 1500,
                addresses: Vec::new(),
                master: master.map(str::to_string),
            },
        );
    }

    /// Create a bridge with the given ports attached, without recording calls
    pub fn seed_bridge(&self, name: &str, ports: &[&str]) {
        self.add_link(name, true, None);
        for port in ports {
            self.add_link(port, false, Some(name));
        }
    }

    /// A VM plugs a port into an existing bridge
    pub fn attach_port(&self, bridge: &str, port: &str) {
        self.add_link(port, false, Some(bridge));
    }

    pub fn fail_delete_of(&self, name: &str) {
        self.fail_delete.lock().insert(name.to_string());
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// The link disappears behind our back (host reboot, manual `ip link del`)
    pub fn vanish(&self, name: &str) {
        self.links.lock().remove(name);
    }

    /// Link goes down and loses its addresses, as after `ip link set down` plus a flush
    pub fn reset_link(&self, name: &str) {
        if let Some(link) = self.links.lock().get_mut(name) {
            link.up = false;
            link.addresses.clear();
        }
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.links.lock().get(name).map(|l| l.up).unwrap_or(false)
    }

    pub fn link_exists(&self, name: &str) -> bool {
        self.links.lock().contains_key(name)
    }

    pub fn addresses(&self, name: &str) -> Vec<String> {
        self.links
            .lock()
            .get(name)
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    pub fn mtu(&self, name: &str) -> Option<u32> {
        self.links.lock().get(name).map(|l| l.mtu)
    }

    fn with_link<T>(&self, name: &str, f: impl FnOnce(&mut FakeLink) -> T) -> NetworkResult<T> {
        let mut links = self.links.lock();
        let link = links
            .get_mut(name)
            .ok_or_else(|| NetworkError::NotFound(format!("link {}", name)))?;
        Ok(f(link))
    }
}

#[async_trait]
impl BridgeOps for FakeBridgeOps {
    async fn create_bridge(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        self.record(format!("create_bridge {} {}", name, mtu));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(simulated("ip link add"));
        }
        if !self.link_exists(name) {
            self.add_link(name, true, None);
        }
        self.with_link(name, |l| {
            l.mtu = mtu;
            l.up = true;
        })
    }

    async fn delete_bridge(&self, name: &str) -> NetworkResult<()> {
        self.record(format!("delete_bridge {}", name));
        if self.fail_delete.lock().contains(name) {
            return Err(simulated("ip link del"));
        }
        let mut links = self.links.lock();
        links.remove(name);
        for link in links.values_mut() {
            if link.master.as_deref() == Some(name) {
                link.master = None;
            }
        }
        Ok(())
    }

    async fn bridge_exists(&self, name: &str) -> NetworkResult<bool> {
        self.record(format!("bridge_exists {}", name));
        Ok(self.links.lock().get(name).map(|l| l.is_bridge).unwrap_or(false))
    }

    async fn assign_address(
        &self,
        name: &str,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> NetworkResult<()> {
        self.record(format!("assign_address {} {}/{}", name, addr, prefix_len));
        let cidr = format!("{}/{}", addr, prefix_len);
        self.with_link(name, |l| {
            if !l.addresses.contains(&cidr) {
                l.addresses.push(cidr);
            }
        })
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        self.record(format!("set_mtu {} {}", name, mtu));
        self.with_link(name, |l| l.mtu = mtu)
    }

    async fn list_ports(&self, name: &str) -> NetworkResult<Vec<String>> {
        self.record(format!("list_ports {}", name));
        let links = self.links.lock();
        if !links.contains_key(name) {
            return Err(NetworkError::NotFound(format!("bridge {}", name)));
        }
        Ok(links
            .iter()
            .filter(|(_, l)| l.master.as_deref() == Some(name))
            .map(|(n, _)| n.clone())
            .collect())
    }

    async fn detach_port(&self, port: &str) -> NetworkResult<()> {
        self.record(format!("detach_port {}", port));
        self.with_link(port, |l| l.master = None)
    }

    async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        self.record(format!("delete_link {}", name));
        if self.fail_delete.lock().contains(name) {
            return Err(NetworkError::Io(std::io::Error::other("Device or resource busy")));
        }
        self.links.lock().remove(name);
        Ok(())
    }

    async fn link_info(&self, name: &str) -> NetworkResult<Option<LinkInfo>> {
        self.record(format!("link_info {}", name));
        Ok(self.links.lock().get(name).map(|l| LinkInfo {
            index: l.index,
            is_up: l.up,
            mtu: Some(l.mtu),
            addresses: l.addresses.clone(),
        }))
    }
}

/// Masquerade rules as a set of (bridge, subnet)
#[derive(Default)]
pub struct FakeNat {
    rules: Mutex<HashSet<(String, String)>>,
    ip_forward: AtomicBool,
    fail_add: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeNat {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn fail_add(&self) {
        self.fail_add.store(true, Ordering::SeqCst);
    }

    pub fn has_rule(&self, bridge: &str, subnet: &str) -> bool {
        self.rules
            .lock()
            .contains(&(bridge.to_string(), subnet.to_string()))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    /// Rules flushed externally
    pub fn flush(&self) {
        self.rules.lock().clear();
    }

    /// A rule that exists outside the record, e.g. under an older subnet
    pub fn seed_rule(&self, bridge: &str, subnet: &str) {
        self.rules
            .lock()
            .insert((bridge.to_string(), subnet.to_string()));
    }
}

#[async_trait]
impl NatOps for FakeNat {
    async fn initialize(&self) -> NetworkResult<()> {
        self.record("initialize".to_string());
        self.ip_forward.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_masquerade(&self, bridge: &str, subnet: &str) -> NetworkResult<()> {
        self.record(format!("add_masquerade {} {}", bridge, subnet));
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(simulated("iptables -t nat -A POSTROUTING"));
        }
        self.seed_rule(bridge, subnet);
        Ok(())
    }

    async fn remove_masquerade(&self, bridge: &str, subnet: &str) -> NetworkResult<()> {
        self.record(format!("remove_masquerade {} {}", bridge, subnet));
        self.rules
            .lock()
            .remove(&(bridge.to_string(), subnet.to_string()));
        Ok(())
    }

    async fn remove_all_for_bridge(&self, bridge: &str) -> NetworkResult<usize> {
        self.record(format!("remove_all_for_bridge {}", bridge));
        let mut rules = self.rules.lock();
        let before = rules.len();
        rules.retain(|(b, _)| b != bridge);
        Ok(before - rules.len())
    }

    async fn masquerade_exists(&self, bridge: &str, subnet: &str) -> NetworkResult<bool> {
        self.record(format!("masquerade_exists {} {}", bridge, subnet));
        Ok(self.has_rule(bridge, subnet))
    }

    async fn inspect(&self, bridge: &str, subnet: &str) -> NatReport {
        self.record(format!("inspect {} {}", bridge, subnet));
        let present = self.has_rule(bridge, subnet);
        NatReport {
            rule_exists: present,
            table_exists: true,
            chain_exists: true,
            forward_rules_exist: present,
            ip_forward_enabled: Some(self.ip_forward.load(Ordering::SeqCst)),
        }
    }
}

/// Daemons as a bridge -> pid table
pub struct FakeDhcp {
    running: Mutex<HashMap<String, u32>>,
    alive: Mutex<HashSet<u32>>,
    files: Mutex<HashSet<String>>,
    next_pid: AtomicU32,
    fail_start: AtomicBool,
    last_config: Mutex<Option<DhcpConfig>>,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeDhcp {
    fn default() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            alive: Mutex::new(HashSet::new()),
            files: Mutex::new(HashSet::new()),
            next_pid: AtomicU32::new(1000),
            fail_start: AtomicBool::new(false),
            last_config: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDhcp {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn running_pid(&self, bridge: &str) -> Option<u32> {
        self.running.lock().get(bridge).copied()
    }

    pub fn has_files(&self, bridge: &str) -> bool {
        self.files.lock().contains(bridge)
    }

    pub fn last_config(&self) -> Option<DhcpConfig> {
        self.last_config.lock().clone()
    }

    /// The daemon dies without anyone asking
    pub fn crash(&self, bridge: &str) {
        if let Some(pid) = self.running.lock().remove(bridge) {
            self.alive.lock().remove(&pid);
        }
    }
}

#[async_trait]
impl DhcpDaemon for FakeDhcp {
    async fn start(&self, config: &DhcpConfig) -> NetworkResult<u32> {
        self.record(format!("start {}", config.bridge));
        self.files.lock().insert(config.bridge.clone());
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(NetworkError::Validation(
                "dnsmasq --test rejected the config".to_string(),
            ));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.running.lock().insert(config.bridge.clone(), pid);
        self.alive.lock().insert(pid);
        *self.last_config.lock() = Some(config.clone());
        Ok(pid)
    }

    async fn stop(&self, pid: u32) -> NetworkResult<()> {
        self.record(format!("stop {}", pid));
        self.alive.lock().remove(&pid);
        self.running.lock().retain(|_, p| *p != pid);
        Ok(())
    }

    async fn kill_by_bridge(&self, bridge: &str) -> NetworkResult<()> {
        self.record(format!("kill_by_bridge {}", bridge));
        self.crash(bridge);
        Ok(())
    }

    async fn verify_running(&self, bridge: &str) -> bool {
        self.record(format!("verify_running {}", bridge));
        self.running_pid(bridge).is_some()
    }

    async fn verify_stopped(&self, bridge: &str) -> bool {
        self.record(format!("verify_stopped {}", bridge));
        self.running_pid(bridge).is_none()
    }

    fn pid_alive(&self, pid: u32) -> bool {
        self.record(format!("pid_alive {}", pid));
        self.alive.lock().contains(&pid)
    }

    async fn remove_files(&self, bridge: &str) -> NetworkResult<()> {
        self.record(format!("remove_files {}", bridge));
        self.files.lock().remove(bridge);
        Ok(())
    }

    async fn files_absent(&self, bridge: &str) -> bool {
        self.record(format!("files_absent {}", bridge));
        !self.has_files(bridge)
    }

    async fn status(&self, bridge: &str, expected_pid: Option<u32>) -> DaemonReport {
        self.record(format!("status {}", bridge));
        let current = self.running_pid(bridge);
        let pid_alive = expected_pid
            .map(|p| self.alive.lock().contains(&p))
            .unwrap_or(false);
        DaemonReport {
            running: current.is_some(),
            expected_pid,
            pid_file_pid: current,
            pid_alive,
            pid_matches: pid_alive && expected_pid == current,
            config_present: self.has_files(bridge),
            pid_file_present: current.is_some(),
            leases_present: self.has_files(bridge),
            lease_count: 0,
            listening_port_67: current.is_some(),
            log_tail: Vec::new(),
        }
    }
}

/// Capture on an idle bridge: returns at once with zero packets
#[derive(Default)]
pub struct FakeCapture {
    calls: Mutex<Vec<(String, u64)>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TrafficCapture for FakeCapture {
    async fn capture(&self, interface: &str, duration: Duration) -> NetworkResult<CaptureResult> {
        self.calls
            .lock()
            .push((interface.to_string(), duration.as_secs()));
        Ok(CaptureResult {
            interface: interface.to_string(),
            lines: Vec::new(),
            truncated: false,
            summary: CaptureSummary {
                duration_secs: duration.as_secs(),
                ..CaptureSummary::default()
            },
        })
    }
}

/// The three fabric fakes, kept concrete so tests can inspect them
pub struct TestFabric {
    pub bridges: Arc<FakeBridgeOps>,
    pub nat: Arc<FakeNat>,
    pub dhcp: Arc<FakeDhcp>,
}

impl TestFabric {
    pub fn new() -> Self {
        Self {
            bridges: Arc::new(FakeBridgeOps::new()),
            nat: Arc::new(FakeNat::new()),
            dhcp: Arc::new(FakeDhcp::new()),
        }
    }

    pub fn fabric(&self) -> Fabric {
        Fabric {
            bridges: self.bridges.clone(),
            nat: self.nat.clone(),
            dhcp: self.dhcp.clone(),
        }
    }

    /// Total calls across all three fakes
    pub fn call_count(&self) -> usize {
        self.bridges.calls().len() + self.nat.calls().len() + self.dhcp.calls().len()
    }
}
