// Department network reconciler
// Drives bridge, daemon, NAT and kernel state towards the stored tenant records.

pub mod error;
pub mod planner;
pub mod rollback;
pub mod steps;


pub use error::{ReconcileError, ReconcileResult};
pub use planner::{SubnetPlanner, SubnetReservation};
pub use steps::{StepOutcome, TeardownReport};

use crate::config::ReconcilerConfig;
use crate::diagnostics::capture::{CaptureResult, TcpdumpCapture, TrafficCapture};
use crate::diagnostics::recommend::{is_drifted, manual_commands, recommendations};
use crate::diagnostics::report::{BridgeReport, DaemonReport, DiagnosticReport, NatReport};
use crate::network::bridge::{BridgeManager, BridgeOps};
use crate::network::dhcp::{DaemonPaths, DhcpConfig, DhcpDaemon, DnsmasqSupervisor};
use crate::network::kernel::KernelPrereqs;
use crate::network::nat::{IptablesNat, NatOps};
use crate::network::netlink::NetlinkHandle;
use crate::network::subnet::{self, SubnetPlan};
use crate::network::tap::TapJanitor;
use crate::store::{NetworkUpdate, SqliteTenantStore, TenantNetworkRecord, TenantStore};
use crate::utils::command::{CommandExecutor, CommandRunner};
use crate::utils::constants::{MAX_CAPTURE_SECS, MAX_MTU, MIN_CAPTURE_SECS, MIN_MTU};
use crate::utils::process::ProcessUtils;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use rollback::{UndoAction, UndoStack};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const STEP_TAPS: &str = "tap_cleanup";
const STEP_DAEMON: &str = "daemon_stop";
const STEP_NAT: &str = "nat_removal";
const STEP_BRIDGE: &str = "bridge_destroy";
const STEP_FILES: &str = "config_cleanup";
const STEP_RECORD: &str = "record_clear";

/// The host primitives a department network is built from
#[derive(Clone)]
pub struct Fabric {
    pub bridges: Arc<dyn BridgeOps>,
    pub nat: Arc<dyn NatOps>,
    pub dhcp: Arc<dyn DhcpDaemon>,
}

/// New DHCP settings for a department. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpSettings {
    pub dns_servers: Option<Vec<String>>,
    pub ntp_servers: Option<Vec<String>>,
    /// `Some(None)` falls back to the default MTU
    pub mtu: Option<Option<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RestoreOutcome {
    Restored,
    Repaired,
    Healthy,
    Failed(String),
}

/// What `restore_all` did, per tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    /// Bridge was missing and the whole fabric was re-provisioned
    pub restored: Vec<String>,
    /// Bridge present; daemon and/or NAT rule put back
    pub repaired: Vec<String>,
    pub healthy: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl RestoreSummary {
    fn record(&mut self, tenant_id: String, outcome: RestoreOutcome) {
        match outcome {
            RestoreOutcome::Restored => self.restored.push(tenant_id),
            RestoreOutcome::Repaired => self.repaired.push(tenant_id),
            RestoreOutcome::Healthy => self.healthy.push(tenant_id),
            RestoreOutcome::Failed(e) => self.failed.push((tenant_id, e)),
        }
    }

    pub fn total(&self) -> usize {
        self.restored.len() + self.repaired.len() + self.healthy.len() + self.failed.len()
    }
}

pub struct Reconciler {
    fabric: Fabric,
    capture: Arc<dyn TrafficCapture>,
    kernel: KernelPrereqs,
    janitor: TapJanitor,
    planner: SubnetPlanner,
    store: Arc<dyn TenantStore>,
    config: ReconcilerConfig,
    tenant_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Serializes kernel setup on configure with its release on the last destroy
    kernel_gate: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        fabric: Fabric,
        capture: Arc<dyn TrafficCapture>,
        kernel: KernelPrereqs,
        store: Arc<dyn TenantStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            janitor: TapJanitor::new(fabric.bridges.clone(), &config),
            planner: SubnetPlanner::new(store.clone()),
            fabric,
            capture,
            kernel,
            store,
            config,
            tenant_locks: DashMap::new(),
            kernel_gate: Mutex::new(()),
        }
    }

    /// Wire the production stack: netlink bridges, iptables, dnsmasq, tcpdump, SQLite
    pub async fn open(config: ReconcilerConfig) -> ReconcileResult<Self> {
        for bin in [&config.dnsmasq_bin, &config.iptables_bin, &config.tcpdump_bin] {
            if !CommandExecutor::is_command_available(bin).await {
                tracing::warn!("{} not found in PATH; operations that need it will fail", bin);
            }
        }

        let runner: Arc<dyn CommandRunner> = Arc::new(CommandExecutor::new(config.command_timeout));
        let netlink = Arc::new(NetlinkHandle::new()?);

        let fabric = Fabric {
            bridges: Arc::new(BridgeManager::new(netlink)),
            nat: Arc::new(IptablesNat::new(
                runner.clone(),
                &config.iptables_bin,
                config.proc_sys_root.clone(),
            )),
            dhcp: Arc::new(DnsmasqSupervisor::new(runner.clone(), &config)),
        };
        let store = Arc::new(SqliteTenantStore::connect(&config.db_path).await?);
        let capture = Arc::new(TcpdumpCapture::new(&config.tcpdump_bin));
        let kernel = KernelPrereqs::new(runner, &config);

        tracing::debug!("Reconciler opened with database {}", config.db_path.display());
        Ok(Self::new(fabric, capture, kernel, store, config))
    }

    pub fn store(&self) -> &Arc<dyn TenantStore> {
        &self.store
    }

    pub fn planner(&self) -> &SubnetPlanner {
        &self.planner
    }

    pub fn kernel(&self) -> &KernelPrereqs {
        &self.kernel
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        self.tenant_locks
            .entry(tenant_id.to_string())
            .or_default()
            .clone()
    }

    async fn load(&self, tenant_id: &str) -> ReconcileResult<TenantNetworkRecord> {
        self.store
            .get(tenant_id)
            .await?
            .ok_or_else(|| ReconcileError::not_found(tenant_id))
    }

    /// Plan for a record that already has a network on file
    fn stored_plan(&self, record: &TenantNetworkRecord) -> ReconcileResult<SubnetPlan> {
        let not_configured = || ReconcileError::NotConfigured {
            tenant_id: record.tenant_id.clone(),
        };
        let bridge = record.bridge_name.as_deref().ok_or_else(not_configured)?;
        let cidr = record.subnet.as_deref().ok_or_else(not_configured)?;
        Ok(subnet::parse_subnet(cidr, &record.tenant_id)?.with_bridge_name(bridge))
    }

    /// Bridge a record-less teardown or diagnosis should look at, and the other
    /// department whose record already owns that derived name, if any.
    async fn derived_bridge(&self, tenant_id: &str) -> ReconcileResult<(String, Option<String>)> {
        let bridge = subnet::bridge_name_for(tenant_id)?;
        let owner = self
            .store
            .list_network_claims()
            .await?
            .into_iter()
            .find(|c| c.tenant_id != tenant_id && c.bridge_name.as_deref() == Some(bridge.as_str()))
            .map(|c| c.tenant_id);
        Ok((bridge, owner))
    }

    fn dhcp_config(&self, plan: &SubnetPlan, record: &TenantNetworkRecord) -> DhcpConfig {
        let or_default = |stored: &Vec<String>, fallback: &Vec<String>| {
            if stored.is_empty() {
                fallback.clone()
            } else {
                stored.clone()
            }
        };
        DhcpConfig {
            bridge: plan.bridge_name.clone(),
            gateway: plan.gateway,
            netmask: plan.netmask,
            broadcast: plan.broadcast,
            range_start: plan.dhcp_start,
            range_end: plan.dhcp_end,
            dns_servers: or_default(&record.dns_servers, &self.config.default_dns_servers),
            ntp_servers: or_default(&record.ntp_servers, &self.config.default_ntp_servers),
            domain: self.config.dhcp_domain.clone(),
            mtu: record.effective_mtu(),
        }
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    /// Bridge, gateway, daemon, NAT. Each step registers its undo first so a
    /// half-applied step is still cleaned up.
    async fn provision(
        &self,
        plan: &SubnetPlan,
        record: &TenantNetworkRecord,
        undo: &mut UndoStack,
    ) -> ReconcileResult<u32> {
        let bridge = plan.bridge_name.as_str();

        undo.push(UndoAction::DeleteBridge {
            bridge: bridge.to_string(),
        });
        self.fabric
            .bridges
            .create_bridge(bridge, record.effective_mtu())
            .await?;

        self.fabric
            .bridges
            .assign_address(bridge, plan.gateway, plan.prefix_len)
            .await?;

        undo.push(UndoAction::RemoveDaemonFiles {
            bridge: bridge.to_string(),
        });
        undo.push(UndoAction::KillDaemon {
            bridge: bridge.to_string(),
        });
        let pid = self
            .fabric
            .dhcp
            .start(&self.dhcp_config(plan, record))
            .await?;

        undo.push(UndoAction::RemoveNat {
            bridge: bridge.to_string(),
            subnet: plan.subnet.clone(),
        });
        self.fabric.nat.add_masquerade(bridge, &plan.subnet).await?;

        Ok(pid)
    }

    /// Provision, persist, and roll everything back if either fails
    async fn provision_and_persist(
        &self,
        plan: &SubnetPlan,
        record: &TenantNetworkRecord,
    ) -> ReconcileResult<u32> {
        let mut undo = UndoStack::new();

        let result = match self.provision(plan, record, &mut undo).await {
            Ok(pid) => self
                .store
                .update_network(&record.tenant_id, &configured_update(plan, pid))
                .await
                .map(|_| pid)
                .map_err(ReconcileError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(pid) => {
                undo.commit();
                Ok(pid)
            }
            Err(e) => {
                tracing::error!(
                    "Provisioning {} for {} failed, rolling back {} steps: {}",
                    plan.bridge_name,
                    record.tenant_id,
                    undo.len(),
                    e
                );
                let failed = undo.unwind(&self.fabric).await;
                if failed > 0 {
                    tracing::warn!(
                        "Rollback of {} left {} step(s) undone",
                        plan.bridge_name,
                        failed
                    );
                }
                Err(e)
            }
        }
    }

    /// Post-condition check after provisioning. Mismatches are drift, not errors.
    async fn verify_configured(&self, plan: &SubnetPlan, pid: u32) -> bool {
        let bridge = plan.bridge_name.as_str();
        let bridge_ok = matches!(self.fabric.bridges.bridge_exists(bridge).await, Ok(true));
        let daemon_ok = self.fabric.dhcp.pid_alive(pid);
        let nat_ok = matches!(
            self.fabric.nat.masquerade_exists(bridge, &plan.subnet).await,
            Ok(true)
        );

        if !(bridge_ok && daemon_ok && nat_ok) {
            tracing::warn!(
                "Post-configure check of {}: bridge={} daemon={} nat={}",
                bridge,
                bridge_ok,
                daemon_ok,
                nat_ok
            );
        }
        bridge_ok && daemon_ok && nat_ok
    }

    /// Give a department its network. Without `subnet` the next free
    /// `10.10.X.0/24` block is allocated.
    pub async fn configure(
        &self,
        tenant_id: &str,
        subnet: Option<&str>,
    ) -> ReconcileResult<TenantNetworkRecord> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let record = self.load(tenant_id).await?;
        if let Some(bridge) = &record.bridge_name {
            return Err(ReconcileError::AlreadyConfigured {
                tenant_id: tenant_id.to_string(),
                subnet: record.subnet.clone().unwrap_or_default(),
                bridge: bridge.clone(),
            });
        }

        // Reservation and kernel setup happen under the gate, so a concurrent
        // last destroy either sees the reservation or finishes before ensure()
        let reservation = {
            let _gate = self.kernel_gate.lock().await;
            let reservation = self.planner.reserve(tenant_id, subnet).await?;
            self.kernel
                .ensure()
                .await
                .map_err(ReconcileError::KernelPrerequisite)?;
            reservation
        };
        let plan = reservation.plan().clone();
        tracing::info!(
            "Configuring network for {}: {} on {}",
            tenant_id,
            plan.subnet,
            plan.bridge_name
        );

        if let Err(e) = self.fabric.nat.initialize().await {
            tracing::warn!("Failed to enable IP forwarding: {}", e);
        }

        let pid = self.provision_and_persist(&plan, &record).await?;
        drop(reservation);

        self.verify_configured(&plan, pid).await;
        tracing::info!(
            "Department {} configured on {} (dnsmasq pid {})",
            tenant_id,
            plan.bridge_name,
            pid
        );
        self.load(tenant_id).await
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn no_taps_left(&self, bridge: &str) -> bool {
        match self.fabric.bridges.list_ports(bridge).await {
            Ok(ports) => !ports.iter().any(|p| self.janitor.is_tap(p)),
            Err(e) => e.is_not_found(),
        }
    }

    async fn nat_gone(&self, bridge: &str, subnet: Option<&str>) -> bool {
        match subnet {
            Some(cidr) => matches!(
                self.fabric.nat.masquerade_exists(bridge, cidr).await,
                Ok(false)
            ),
            None => true,
        }
    }

    async fn record_cleared(&self, tenant_id: &str) -> bool {
        matches!(self.store.get(tenant_id).await, Ok(Some(r)) if !r.is_configured())
    }

    /// The ordered teardown shared by `destroy` and `force_destroy`
    async fn teardown(
        &self,
        record: &TenantNetworkRecord,
        bridge: &str,
        force: bool,
    ) -> TeardownReport {
        let tenant_id = record.tenant_id.as_str();
        let subnet = record.subnet.as_deref();
        let mut report = TeardownReport::new(tenant_id, Some(bridge));

        report.steps.push(
            steps::run_step(
                STEP_TAPS,
                async {
                    let cleanup = self.janitor.cleanup_orphans(bridge).await;
                    if cleanup.failed.is_empty() {
                        Ok(())
                    } else {
                        Err(format!("could not remove {}", cleanup.failed.join(", ")))
                    }
                },
                self.no_taps_left(bridge),
            )
            .await,
        );

        report.steps.push(
            steps::run_step(
                STEP_DAEMON,
                async {
                    let mut errors = Vec::new();
                    if let Some(pid) = record.daemon_pid {
                        if let Err(e) = self.fabric.dhcp.stop(pid).await {
                            errors.push(e.to_string());
                        }
                    }
                    if let Err(e) = self.fabric.dhcp.kill_by_bridge(bridge).await {
                        errors.push(e.to_string());
                    }
                    join_errors(errors)
                },
                self.fabric.dhcp.verify_stopped(bridge),
            )
            .await,
        );

        let nat_step = if force {
            steps::run_step(
                STEP_NAT,
                async {
                    let mut errors = Vec::new();
                    if let Some(cidr) = subnet {
                        if let Err(e) = self.fabric.nat.remove_masquerade(bridge, cidr).await {
                            errors.push(e.to_string());
                        }
                    }
                    // Catches rules for subnets the record no longer knows about
                    match self.fabric.nat.remove_all_for_bridge(bridge).await {
                        Ok(0) => {}
                        Ok(n) => {
                            tracing::info!("Removed {} leftover NAT rule(s) for {}", n, bridge)
                        }
                        Err(e) => errors.push(e.to_string()),
                    }
                    join_errors(errors)
                },
                self.nat_gone(bridge, subnet),
            )
            .await
        } else if let Some(cidr) = subnet {
            steps::run_step(
                STEP_NAT,
                async {
                    self.fabric
                        .nat
                        .remove_masquerade(bridge, cidr)
                        .await
                        .map_err(|e| e.to_string())
                },
                self.nat_gone(bridge, subnet),
            )
            .await
        } else {
            StepOutcome::skipped(STEP_NAT)
        };
        report.steps.push(nat_step);

        report.steps.push(
            steps::run_step(
                STEP_BRIDGE,
                async {
                    self.fabric
                        .bridges
                        .delete_bridge(bridge)
                        .await
                        .map_err(|e| e.to_string())
                },
                async { matches!(self.fabric.bridges.bridge_exists(bridge).await, Ok(false)) },
            )
            .await,
        );

        report.steps.push(
            steps::run_step(
                STEP_FILES,
                async {
                    self.fabric
                        .dhcp
                        .remove_files(bridge)
                        .await
                        .map_err(|e| e.to_string())
                },
                self.fabric.dhcp.files_absent(bridge),
            )
            .await,
        );

        report.steps.push(
            steps::run_step(
                STEP_RECORD,
                async {
                    self.store
                        .clear_network(tenant_id)
                        .await
                        .map_err(|e| e.to_string())
                },
                self.record_cleared(tenant_id),
            )
            .await,
        );

        report
    }

    /// With no configured department left and no configure in flight, drop
    /// kernel persistence and the latch
    async fn release_kernel_if_idle(&self) {
        let _gate = self.kernel_gate.lock().await;
        let pending = self.planner.pending_count();
        if pending > 0 {
            tracing::debug!("{} configure(s) in flight, keeping kernel persistence", pending);
            return;
        }
        match self.store.list_with_bridge().await {
            Ok(remaining) if remaining.is_empty() => {
                tracing::info!("Last department network removed, clearing kernel persistence");
                self.kernel.remove_persistence().await;
                self.kernel.reset().await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not check for remaining networks: {}", e),
        }
    }

    /// Tear down a department's network. Step failures are reported, never raised.
    pub async fn destroy(&self, tenant_id: &str) -> ReconcileResult<TeardownReport> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let record = self.load(tenant_id).await?;
        let Some(bridge) = record.bridge_name.clone() else {
            tracing::info!("Department {} has no network, nothing to destroy", tenant_id);
            return Ok(TeardownReport::new(tenant_id, None));
        };

        tracing::info!("Destroying network {} of {}", bridge, tenant_id);
        let report = self.teardown(&record, &bridge, false).await;
        report.log_summary();
        self.release_kernel_if_idle().await;
        Ok(report)
    }

    /// Teardown for inconsistent state: derives the bridge name when the record
    /// lost it and sweeps every NAT rule tagged for the bridge. A derived name
    /// that another department's record owns is refused.
    pub async fn force_destroy(&self, tenant_id: &str) -> ReconcileResult<TeardownReport> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let record = self.load(tenant_id).await?;
        let bridge = match &record.bridge_name {
            Some(bridge) => bridge.clone(),
            None => match self.derived_bridge(tenant_id).await? {
                (bridge, Some(owner)) => {
                    return Err(ReconcileError::validation(format!(
                        "{} has no network on record and {} belongs to department {}",
                        tenant_id, bridge, owner
                    )));
                }
                (bridge, None) => bridge,
            },
        };

        tracing::warn!("Force-destroying network {} of {}", bridge, tenant_id);
        let report = self.teardown(&record, &bridge, true).await;
        report.log_summary();
        self.release_kernel_if_idle().await;
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Bring every stored network back after a restart. Never fails.
    pub async fn restore_all(&self) -> RestoreSummary {
        let mut summary = RestoreSummary::default();

        if let Err(e) = self.kernel.ensure().await {
            tracing::error!("Kernel prerequisites failed during restore: {}", e);
        }
        if let Err(e) = self.fabric.nat.initialize().await {
            tracing::warn!("Failed to enable IP forwarding: {}", e);
        }

        let records = match self.store.list_with_bridge().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Cannot list department networks to restore: {}", e);
                return summary;
            }
        };
        tracing::info!("Restoring {} department network(s)", records.len());

        let outcomes: Vec<(String, RestoreOutcome)> = stream::iter(records)
            .map(|record| self.restore_one(record))
            .buffer_unordered(self.config.restore_concurrency.max(1))
            .collect()
            .await;

        for (tenant_id, outcome) in outcomes {
            summary.record(tenant_id, outcome);
        }
        summary.restored.sort();
        summary.repaired.sort();
        summary.healthy.sort();
        summary.failed.sort();

        tracing::info!(
            "Restore finished: {} restored, {} repaired, {} healthy, {} failed",
            summary.restored.len(),
            summary.repaired.len(),
            summary.healthy.len(),
            summary.failed.len()
        );
        summary
    }

    async fn restore_one(&self, record: TenantNetworkRecord) -> (String, RestoreOutcome) {
        let lock = self.tenant_lock(&record.tenant_id);
        let _guard = lock.lock().await;

        let outcome = match self.try_restore(&record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Failed to restore network of {}: {}", record.tenant_id, e);
                RestoreOutcome::Failed(e.to_string())
            }
        };
        (record.tenant_id, outcome)
    }

    async fn try_restore(&self, record: &TenantNetworkRecord) -> ReconcileResult<RestoreOutcome> {
        let plan = self.stored_plan(record)?;
        let bridge = plan.bridge_name.as_str();

        if !self.fabric.bridges.bridge_exists(bridge).await? {
            tracing::info!("Bridge {} missing, re-provisioning {}", bridge, record.tenant_id);
            if let Err(e) = self.fabric.dhcp.kill_by_bridge(bridge).await {
                tracing::warn!("Could not clear stale dnsmasq for {}: {}", bridge, e);
            }
            let pid = self.provision_and_persist(&plan, record).await?;
            self.verify_configured(&plan, pid).await;
            return Ok(RestoreOutcome::Restored);
        }

        // An existing bridge is left as it is; only the daemon and NAT rule are repaired
        let mut repaired = false;

        let daemon_alive = record
            .daemon_pid
            .map(|pid| self.fabric.dhcp.pid_alive(pid))
            .unwrap_or(false);
        if !daemon_alive {
            tracing::info!("dnsmasq for {} is not running, restarting", bridge);
            self.restart_locked(record, &plan).await?;
            repaired = true;
        }

        if !self.fabric.nat.masquerade_exists(bridge, &plan.subnet).await? {
            tracing::info!("NAT rule for {} missing, re-adding", bridge);
            self.fabric.nat.add_masquerade(bridge, &plan.subnet).await?;
            repaired = true;
        }

        Ok(if repaired {
            RestoreOutcome::Repaired
        } else {
            RestoreOutcome::Healthy
        })
    }

    // ------------------------------------------------------------------
    // Daemon and settings
    // ------------------------------------------------------------------

    /// Restart with the settings on `record`; caller holds the tenant lock
    async fn restart_locked(
        &self,
        record: &TenantNetworkRecord,
        plan: &SubnetPlan,
    ) -> ReconcileResult<u32> {
        let config = self.dhcp_config(plan, record);
        match self.fabric.dhcp.restart(record.daemon_pid, &config).await {
            Ok(pid) => {
                self.store
                    .update_network(&record.tenant_id, &NetworkUpdate::daemon_pid(Some(pid)))
                    .await?;
                tracing::info!("dnsmasq for {} restarted with pid {}", plan.bridge_name, pid);
                Ok(pid)
            }
            Err(e) => {
                if let Err(store_err) = self
                    .store
                    .update_network(&record.tenant_id, &NetworkUpdate::daemon_pid(None))
                    .await
                {
                    tracing::warn!(
                        "Could not clear stale pid of {}: {}",
                        record.tenant_id,
                        store_err
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Restart a department's DHCP daemon with its current persisted settings
    pub async fn restart_daemon(&self, tenant_id: &str) -> ReconcileResult<u32> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let record = self.load(tenant_id).await?;
        let plan = self.stored_plan(&record)?;
        self.restart_locked(&record, &plan).await
    }

    /// Apply new DNS/NTP/MTU settings to a running network, then persist them.
    /// When applying fails the record keeps its previous settings.
    pub async fn update_settings(
        &self,
        tenant_id: &str,
        settings: DhcpSettings,
    ) -> ReconcileResult<TenantNetworkRecord> {
        validate_settings(&settings)?;

        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let before = self.load(tenant_id).await?;
        let mut update = NetworkUpdate {
            dns_servers: settings.dns_servers.clone(),
            ntp_servers: settings.ntp_servers.clone(),
            mtu: settings.mtu,
            ..Default::default()
        };

        if before.is_configured() {
            let mut candidate = before.clone();
            update.apply(&mut candidate, before.updated_at);
            let pid = self.apply_settings(&before, &candidate).await?;
            update.daemon_pid = Some(Some(pid));
        }

        self.store.update_network(tenant_id, &update).await?;
        tracing::info!("Updated DHCP settings of {}", tenant_id);
        self.load(tenant_id).await
    }

    /// MTU and daemon restart for `candidate`; on failure the old MTU is put back
    async fn apply_settings(
        &self,
        before: &TenantNetworkRecord,
        candidate: &TenantNetworkRecord,
    ) -> ReconcileResult<u32> {
        let plan = self.stored_plan(candidate)?;
        let bridge = plan.bridge_name.as_str();
        let mtu_changed = candidate.effective_mtu() != before.effective_mtu();

        if mtu_changed {
            self.fabric
                .bridges
                .set_mtu(bridge, candidate.effective_mtu())
                .await?;
        }

        let config = self.dhcp_config(&plan, candidate);
        match self.fabric.dhcp.restart(before.daemon_pid, &config).await {
            Ok(pid) => {
                tracing::info!("dnsmasq for {} restarted with pid {}", bridge, pid);
                Ok(pid)
            }
            Err(e) => {
                tracing::error!("New settings for {} not applied: {}", before.tenant_id, e);
                if mtu_changed {
                    if let Err(mtu_err) = self
                        .fabric
                        .bridges
                        .set_mtu(bridge, before.effective_mtu())
                        .await
                    {
                        tracing::warn!("Could not restore MTU of {}: {}", bridge, mtu_err);
                    }
                }
                if let Err(store_err) = self
                    .store
                    .update_network(&before.tenant_id, &NetworkUpdate::daemon_pid(None))
                    .await
                {
                    tracing::warn!(
                        "Could not clear stale pid of {}: {}",
                        before.tenant_id,
                        store_err
                    );
                }
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    async fn inspect_bridge(
        &self,
        bridge: &str,
        expected_address: Option<String>,
        expected_mtu: u32,
    ) -> BridgeReport {
        let mut report = BridgeReport {
            name: bridge.to_string(),
            expected_address,
            expected_mtu,
            ..Default::default()
        };

        match self.fabric.bridges.link_info(bridge).await {
            Ok(Some(info)) => {
                report.exists = true;
                report.is_up = info.is_up;
                report.addresses = info.addresses;
                report.mtu = info.mtu;
                report.ports = self
                    .fabric
                    .bridges
                    .list_ports(bridge)
                    .await
                    .unwrap_or_default();
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("Cannot inspect {}: {}", bridge, e),
        }
        report
    }

    /// Read-only snapshot of everything that makes up a department's network
    pub async fn diagnose(&self, tenant_id: &str) -> ReconcileResult<DiagnosticReport> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let record = self.load(tenant_id).await?;
        let (bridge, bridge_owner) = match &record.bridge_name {
            Some(bridge) => (bridge.clone(), None),
            None => self.derived_bridge(tenant_id).await?,
        };
        let expected_address = record
            .subnet
            .as_deref()
            .and_then(|cidr| subnet::parse_subnet(cidr, tenant_id).ok())
            .map(|plan| format!("{}/{}", plan.gateway, plan.prefix_len));

        // Whatever runs on a bridge another record owns is not ours to report
        let (bridge_report, daemon) = match &bridge_owner {
            Some(owner) => {
                tracing::debug!(
                    "{} belongs to {}, not inspecting it for {}",
                    bridge,
                    owner,
                    tenant_id
                );
                let report = BridgeReport {
                    name: bridge.clone(),
                    expected_mtu: record.effective_mtu(),
                    ..Default::default()
                };
                (report, DaemonReport::default())
            }
            None => (
                self.inspect_bridge(&bridge, expected_address, record.effective_mtu())
                    .await,
                self.fabric.dhcp.status(&bridge, record.daemon_pid).await,
            ),
        };
        let kernel = self.kernel.inspect().await;
        let nat = match record.subnet.as_deref() {
            Some(cidr) => self.fabric.nat.inspect(&bridge, cidr).await,
            None => NatReport::default(),
        };
        let taps = if bridge_report.exists {
            self.janitor.inspect(&bridge).await
        } else {
            Vec::new()
        };
        let paths = DaemonPaths::for_bridge(&self.config.dnsmasq_dir, &bridge);

        let mut report = DiagnosticReport {
            tenant_id: tenant_id.to_string(),
            subnet: record.subnet.clone(),
            configured: record.is_configured(),
            generated_at: ProcessUtils::get_timestamp(),
            bridge: bridge_report,
            bridge_owner,
            daemon,
            kernel,
            nat,
            taps,
            drifted: false,
            recommendations: Vec::new(),
            manual_commands: manual_commands(&bridge, record.subnet.as_deref(), &paths),
        };
        report.drifted = is_drifted(&report);
        report.recommendations = recommendations(&report);

        if report.drifted {
            tracing::warn!("Network of {} has drifted from its record", tenant_id);
        }
        Ok(report)
    }

    /// Watch DHCP traffic on the department bridge for `seconds`
    pub async fn capture_traffic(
        &self,
        tenant_id: &str,
        seconds: u64,
    ) -> ReconcileResult<CaptureResult> {
        if !(MIN_CAPTURE_SECS..=MAX_CAPTURE_SECS).contains(&seconds) {
            return Err(ReconcileError::validation(format!(
                "capture duration must be {}-{} seconds, got {}",
                MIN_CAPTURE_SECS, MAX_CAPTURE_SECS, seconds
            )));
        }

        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let record = self.load(tenant_id).await?;
        let bridge = record
            .bridge_name
            .ok_or_else(|| ReconcileError::NotConfigured {
                tenant_id: tenant_id.to_string(),
            })?;

        Ok(self
            .capture
            .capture(&bridge, Duration::from_secs(seconds))
            .await?)
    }

    // ------------------------------------------------------------------
    // Department records
    // ------------------------------------------------------------------

    /// Register a department with no network yet
    pub async fn add_department(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> ReconcileResult<TenantNetworkRecord> {
        subnet::bridge_name_for(tenant_id)?;
        let record = TenantNetworkRecord::new(tenant_id, name, ProcessUtils::get_timestamp());
        self.store.insert(&record).await?;
        tracing::info!("Registered department {}", tenant_id);
        Ok(record)
    }

    /// Forget a department. Its network must be destroyed first.
    pub async fn remove_department(&self, tenant_id: &str) -> ReconcileResult<()> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let record = self.load(tenant_id).await?;
        if let Some(bridge) = &record.bridge_name {
            return Err(ReconcileError::AlreadyConfigured {
                tenant_id: tenant_id.to_string(),
                subnet: record.subnet.clone().unwrap_or_default(),
                bridge: bridge.clone(),
            });
        }
        self.store.delete(tenant_id).await?;
        drop(_guard);
        self.tenant_locks.remove(tenant_id);
        Ok(())
    }

    pub async fn list_departments(&self) -> ReconcileResult<Vec<TenantNetworkRecord>> {
        Ok(self.store.list_all().await?)
    }
}

fn configured_update(plan: &SubnetPlan, pid: u32) -> NetworkUpdate {
    NetworkUpdate {
        subnet: Some(plan.subnet.clone()),
        bridge_name: Some(plan.bridge_name.clone()),
        gateway_ip: Some(plan.gateway.to_string()),
        dhcp_range_start: Some(plan.dhcp_start.to_string()),
        dhcp_range_end: Some(plan.dhcp_end.to_string()),
        daemon_pid: Some(Some(pid)),
        ..Default::default()
    }
}

fn join_errors(errors: Vec<String>) -> Result<(), String> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn validate_settings(settings: &DhcpSettings) -> ReconcileResult<()> {
    let lists = [
        ("DNS", settings.dns_servers.as_ref()),
        ("NTP", settings.ntp_servers.as_ref()),
    ];
    for (kind, servers) in lists {
        for server in servers.into_iter().flatten() {
            if server.trim().parse::<Ipv4Addr>().is_err() {
                return Err(ReconcileError::validation(format!(
                    "{} server '{}' is not an IPv4 address",
                    kind, server
                )));
            }
        }
    }

    if let Some(Some(mtu)) = settings.mtu {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(ReconcileError::validation(format!(
                "MTU {} outside {}..={}",
                mtu, MIN_MTU, MAX_MTU
            )));
        }
    }
    Ok(())
}
