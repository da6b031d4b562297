use crate::config::ReconcilerConfig;
use crate::diagnostics::report::TapReport;
use crate::network::bridge::BridgeOps;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// IFF_PERSIST in `/sys/class/net/<dev>/tun_flags`
const IFF_PERSIST: u32 = 0x0800;
/// Kernel truncates process names to this many bytes
const COMM_LEN: usize = 15;

/// Outcome of a TAP sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TapCleanup {
    pub removed: Vec<String>,
    /// Devices that could not be detached or deleted, typically still held by a VM
    pub failed: Vec<String>,
}

/// Detaches and deletes virtual NICs left on a bridge before it is torn down
pub struct TapJanitor {
    bridges: Arc<dyn BridgeOps>,
    prefixes: Vec<String>,
    hypervisors: Vec<String>,
    proc_root: PathBuf,
    sys_root: PathBuf,
}

impl TapJanitor {
    pub fn new(bridges: Arc<dyn BridgeOps>, config: &ReconcilerConfig) -> Self {
        Self {
            bridges,
            prefixes: config.tap_prefixes.clone(),
            hypervisors: config.hypervisor_names.clone(),
            proc_root: config.proc_root.clone(),
            sys_root: config.sys_root.clone(),
        }
    }

    pub fn is_tap(&self, name: &str) -> bool {
        self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    async fn tap_ports(&self, bridge: &str) -> Option<Vec<String>> {
        match self.bridges.list_ports(bridge).await {
            Ok(ports) => Some(ports.into_iter().filter(|p| self.is_tap(p)).collect()),
            Err(e) => {
                tracing::warn!("Cannot list ports of {}: {}", bridge, e);
                None
            }
        }
    }

    /// Detach then delete every TAP on the bridge. Never fails.
    pub async fn cleanup_orphans(&self, bridge: &str) -> TapCleanup {
        let mut outcome = TapCleanup::default();
        let Some(taps) = self.tap_ports(bridge).await else {
            return outcome;
        };

        for tap in taps {
            if let Err(e) = self.bridges.detach_port(&tap).await {
                tracing::warn!("Failed to detach {} from {}: {}", tap, bridge, e);
            }
            match self.bridges.delete_link(&tap).await {
                Ok(()) => {
                    tracing::info!("Removed TAP {} from {}", tap, bridge);
                    outcome.removed.push(tap);
                }
                Err(e) => {
                    // Busy devices belong to running VMs
                    tracing::warn!("Could not delete TAP {}: {}", tap, e);
                    outcome.failed.push(tap);
                }
            }
        }

        outcome
    }

    /// Carrier, persist flag and owning hypervisor of each TAP on the bridge
    pub async fn inspect(&self, bridge: &str) -> Vec<TapReport> {
        let Some(taps) = self.tap_ports(bridge).await else {
            return Vec::new();
        };
        if taps.is_empty() {
            return Vec::new();
        }

        let owners = find_tap_owners(&self.proc_root, &self.hypervisors).await;
        let mut reports = Vec::with_capacity(taps.len());
        for tap in taps {
            let dev_dir = self.sys_root.join("class/net").join(&tap);
            let carrier = read_trimmed(&dev_dir.join("carrier")).await.as_deref() == Some("1");
            let persist = read_trimmed(&dev_dir.join("tun_flags"))
                .await
                .and_then(|flags| parse_hex(&flags))
                .map(|flags| flags & IFF_PERSIST != 0)
                .unwrap_or(false);
            let owner = owners.get(&tap).cloned();

            reports.push(TapReport {
                orphan: persist && !carrier && owner.is_none(),
                owner_pid: owner.as_ref().map(|(pid, _)| *pid),
                owner_name: owner.map(|(_, name)| name),
                name: tap,
                carrier,
                persist,
            });
        }
        reports
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

fn parse_hex(raw: &str) -> Option<u32> {
    let digits = raw.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).ok()
}

fn is_hypervisor(comm: &str, names: &[String]) -> bool {
    names.iter().any(|name| {
        let cut = &name[..name.len().min(COMM_LEN)];
        comm.starts_with(cut)
    })
}

/// TAP device name -> (pid, comm) for every hypervisor holding a tun fd
pub async fn find_tap_owners(
    proc_root: &Path,
    hypervisors: &[String],
) -> HashMap<String, (u32, String)> {
    let mut owners = HashMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(proc_root).await else {
        return owners;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Some(comm) = read_trimmed(&entry.path().join("comm")).await else {
            continue;
        };
        if !is_hypervisor(&comm, hypervisors) {
            continue;
        }

        let Ok(mut fds) = tokio::fs::read_dir(entry.path().join("fdinfo")).await else {
            continue;
        };
        while let Ok(Some(fd)) = fds.next_entry().await {
            let Ok(info) = tokio::fs::read_to_string(fd.path()).await else {
                continue;
            };
            for line in info.lines() {
                if let Some(dev) = line.strip_prefix("iff:") {
                    owners.insert(dev.trim().to_string(), (pid, comm.clone()));
                }
            }
        }
    }

    owners
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{config_in, FakeBridgeOps};
    use std::fs;

    fn write(path: PathBuf, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_inspect_classifies_taps() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let net = config.sys_root.join("class/net");
        write(net.join("tap0/carrier"), "0\n");
        write(net.join("tap0/tun_flags"), "0x1802\n");
        write(net.join("tap1/carrier"), "1\n");
        write(net.join("tap1/tun_flags"), "0x1002\n");
        write(net.join("vnet0/carrier"), "0\n");
        write(net.join("vnet0/tun_flags"), "0x1802\n");
        write(config.proc_root.join("4242/comm"), "qemu-system-x86\n");
        write(
            config.proc_root.join("4242/fdinfo/17"),
            "pos:\t0\nflags:\t02\nmnt_id:\t15\niff:\tvnet0\n",
        );
        // Not a hypervisor, must be ignored
        write(config.proc_root.join("77/comm"), "bash\n");
        write(config.proc_root.join("77/fdinfo/3"), "iff:\ttap0\n");

        let bridges = Arc::new(FakeBridgeOps::new());
        bridges.seed_bridge("dept-acme01", &["tap0", "tap1", "vnet0", "eth9"]);
        let janitor = TapJanitor::new(bridges, &config);

        let reports = janitor.inspect("dept-acme01").await;
        assert_eq!(reports.len(), 3);

        let tap0 = reports.iter().find(|r| r.name == "tap0").unwrap();
        assert!(tap0.persist && !tap0.carrier && tap0.orphan);
        assert_eq!(tap0.owner_pid, None);

        let tap1 = reports.iter().find(|r| r.name == "tap1").unwrap();
        assert!(tap1.carrier && !tap1.orphan);

        let vnet0 = reports.iter().find(|r| r.name == "vnet0").unwrap();
        assert_eq!(vnet0.owner_pid, Some(4242));
        assert_eq!(vnet0.owner_name.as_deref(), Some("qemu-system-x86"));
        assert!(!vnet0.orphan);
    }

    #[tokio::test]
    async fn test_cleanup_skips_non_taps_and_absorbs_failures() {
        let dir = tempfile::tempdir().unwrap();
        let bridges = Arc::new(FakeBridgeOps::new());
        bridges.seed_bridge("dept-acme01", &["tap0", "vnet3", "eth9"]);
        bridges.fail_delete_of("vnet3");
        let janitor = TapJanitor::new(bridges.clone(), &config_in(dir.path()));

        let outcome = janitor.cleanup_orphans("dept-acme01").await;
        assert_eq!(outcome.removed, vec!["tap0"]);
        assert_eq!(outcome.failed, vec!["vnet3"]);
        assert!(bridges.link_exists("eth9"));
        assert!(!bridges.link_exists("tap0"));
    }

    #[tokio::test]
    async fn test_cleanup_on_missing_bridge_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let janitor = TapJanitor::new(Arc::new(FakeBridgeOps::new()), &config_in(dir.path()));
        assert_eq!(janitor.cleanup_orphans("dept-gone00").await, TapCleanup::default());
    }

    #[test]
    fn test_hypervisor_names_match_truncated_comm() {
        let names = vec!["cloud-hypervisor".to_string(), "firecracker".to_string()];
        assert!(is_hypervisor("cloud-hyperviso", &names));
        assert!(is_hypervisor("firecracker", &names));
        assert!(!is_hypervisor("sshd", &names));
        assert_eq!(parse_hex("0x1802"), Some(0x1802));
    }
}
