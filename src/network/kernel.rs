use crate::config::ReconcilerConfig;
use crate::diagnostics::report::{KernelReport, SysctlValue};
use crate::network::error::NetworkResult;
use crate::utils::command::{run_checked, CommandRunner};
use crate::utils::constants::{BRIDGE_NF_SYSCTLS, BR_NETFILTER_MODULE};
use crate::utils::filesystem::FileSystemUtils;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Loads `br_netfilter` and turns off netfilter on bridged traffic so DHCP
/// broadcasts cross department bridges untouched.
///
/// The latch lives in this object, not in a global. Holding the async mutex
/// for the whole of `ensure` means concurrent callers do the work once.
pub struct KernelPrereqs {
    runner: Arc<dyn CommandRunner>,
    proc_sys_root: PathBuf,
    sys_root: PathBuf,
    sysctl_dropin: PathBuf,
    modules_load_file: PathBuf,
    configured: Mutex<bool>,
}

fn sysctl_key(relative: &str) -> String {
    relative.replace('/', ".")
}

fn dropin_content() -> String {
    let mut content = String::from("# Managed by deptnet: bridged traffic bypasses netfilter\n");
    for path in BRIDGE_NF_SYSCTLS {
        content.push_str(&format!("{} = 0\n", sysctl_key(path)));
    }
    content
}

impl KernelPrereqs {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &ReconcilerConfig) -> Self {
        Self {
            runner,
            proc_sys_root: config.proc_sys_root.clone(),
            sys_root: config.sys_root.clone(),
            sysctl_dropin: config.sysctl_dropin.clone(),
            modules_load_file: config.modules_load_file.clone(),
            configured: Mutex::new(false),
        }
    }

    fn module_dir(&self) -> PathBuf {
        self.sys_root.join("module").join(BR_NETFILTER_MODULE)
    }

    async fn module_loaded(&self) -> bool {
        FileSystemUtils::exists(self.module_dir()).await
    }

    /// Load the module and apply sysctls once per latch cycle.
    /// Only a module load failure is an error.
    pub async fn ensure(&self) -> NetworkResult<()> {
        let mut configured = self.configured.lock().await;
        if *configured {
            tracing::debug!("Kernel prerequisites already configured");
            return Ok(());
        }

        if !self.module_loaded().await {
            tracing::info!("Loading {} kernel module", BR_NETFILTER_MODULE);
            run_checked(self.runner.as_ref(), "modprobe", &[BR_NETFILTER_MODULE]).await?;
        }

        if let Err(e) = FileSystemUtils::write_file(
            &self.modules_load_file,
            &format!("{}\n", BR_NETFILTER_MODULE),
        )
        .await
        {
            tracing::warn!("Failed to persist module autoload: {}", e);
        }

        if let Err(e) = FileSystemUtils::write_file(&self.sysctl_dropin, &dropin_content()).await {
            tracing::warn!("Failed to write sysctl drop-in: {}", e);
        }

        for relative in BRIDGE_NF_SYSCTLS {
            self.apply_sysctl(relative, "0").await;
        }

        *configured = true;
        tracing::info!("Kernel prerequisites configured");
        Ok(())
    }

    async fn apply_sysctl(&self, relative: &str, value: &str) {
        let path = self.proc_sys_root.join(relative);
        if let Err(e) = tokio::fs::write(&path, format!("{}\n", value)).await {
            tracing::warn!("Failed to set {}: {}", sysctl_key(relative), e);
            return;
        }
        match read_value(&path).await {
            Some(actual) if actual == value => {}
            Some(actual) => tracing::warn!(
                "{} reads back {} instead of {}",
                sysctl_key(relative),
                actual,
                value
            ),
            None => tracing::warn!("Could not read back {}", sysctl_key(relative)),
        }
    }

    /// Forget the latch so the next `ensure` redoes everything
    pub async fn reset(&self) {
        *self.configured.lock().await = false;
    }

    pub async fn is_configured(&self) -> bool {
        *self.configured.lock().await
    }

    /// Delete the drop-in and autoload files. Failures are logged.
    pub async fn remove_persistence(&self) {
        for path in [&self.sysctl_dropin, &self.modules_load_file] {
            match FileSystemUtils::remove_file(path).await {
                Ok(()) => tracing::info!("Removed {}", path.display()),
                Err(e) => tracing::warn!("{}", e),
            }
        }
    }

    pub async fn inspect(&self) -> KernelReport {
        let mut sysctls = Vec::new();
        for relative in BRIDGE_NF_SYSCTLS {
            sysctls.push(SysctlValue {
                key: sysctl_key(relative),
                value: read_value(&self.proc_sys_root.join(relative)).await,
            });
        }

        KernelReport {
            module_loaded: self.module_loaded().await,
            sysctls,
            dropin_present: FileSystemUtils::exists(&self.sysctl_dropin).await,
            autoload_present: FileSystemUtils::exists(&self.modules_load_file).await,
        }
    }
}

async fn read_value(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use crate::utils::command::CommandResult;

    fn fixture(runner: Arc<ScriptedRunner>) -> (tempfile::TempDir, KernelPrereqs) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::testing::config_in(dir.path());
        std::fs::create_dir_all(config.proc_sys_root.join("net/bridge")).unwrap();
        let prereqs = KernelPrereqs::new(runner, &config);
        (dir, prereqs)
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let runner = Arc::new(ScriptedRunner::ok());
        let (_dir, prereqs) = fixture(runner.clone());

        prereqs.ensure().await.unwrap();
        prereqs.ensure().await.unwrap();

        let modprobes = runner.calls().iter().filter(|c| c.starts_with("modprobe")).count();
        assert_eq!(modprobes, 1);

        let report = prereqs.inspect().await;
        assert!(report.dropin_present);
        assert!(report.autoload_present);
        assert!(report.bridge_nf_disabled());
    }

    #[tokio::test]
    async fn test_loaded_module_is_not_reloaded() {
        let runner = Arc::new(ScriptedRunner::ok());
        let (_dir, prereqs) = fixture(runner.clone());
        std::fs::create_dir_all(prereqs.module_dir()).unwrap();

        prereqs.ensure().await.unwrap();
        assert!(runner.calls().is_empty());
        assert!(prereqs.inspect().await.module_loaded);
    }

    #[tokio::test]
    async fn test_module_load_failure_is_fatal() {
        let runner = Arc::new(ScriptedRunner::new(|_, _| {
            CommandResult::from_exit(1, "", "FATAL: Module br_netfilter not found")
        }));
        let (_dir, prereqs) = fixture(runner);

        let err = prereqs.ensure().await.unwrap_err();
        assert!(err.to_string().contains("br_netfilter"));
        assert!(!prereqs.is_configured().await);
    }

    #[tokio::test]
    async fn test_reset_and_remove_persistence() {
        let runner = Arc::new(ScriptedRunner::ok());
        let (_dir, prereqs) = fixture(runner.clone());

        prereqs.ensure().await.unwrap();
        prereqs.remove_persistence().await;
        prereqs.reset().await;
        assert!(!prereqs.is_configured().await);

        let report = prereqs.inspect().await;
        assert!(!report.dropin_present);
        assert!(!report.autoload_present);

        prereqs.ensure().await.unwrap();
        let modprobes = runner.calls().iter().filter(|c| c.starts_with("modprobe")).count();
        assert_eq!(modprobes, 2);
    }

    #[test]
    fn test_dropin_content() {
        let content = dropin_content();
        assert!(content.contains("net.bridge.bridge-nf-call-iptables = 0"));
        assert!(content.contains("net.bridge.bridge-nf-call-ip6tables = 0"));
        assert!(content.contains("net.bridge.bridge-nf-call-arptables = 0"));
    }
}
