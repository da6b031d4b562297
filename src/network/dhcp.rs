// DHCP/DNS daemon supervision
// One dnsmasq per department bridge, with its own config, pid, lease and log file.

use crate::config::ReconcilerConfig;
use crate::diagnostics::report::DaemonReport;
use crate::network::error::{NetworkError, NetworkResult};
use crate::utils::command::{render, run_checked, CommandRunner};
use crate::utils::constants::{DHCP_LEASE_TIME, DHCP_SERVER_PORT};
use crate::utils::filesystem::FileSystemUtils;
use crate::utils::process::ProcessUtils;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const LOG_TAIL_LINES: usize = 20;

/// Everything the daemon needs to serve one bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpConfig {
    pub bridge: String,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub dns_servers: Vec<String>,
    pub ntp_servers: Vec<String>,
    pub domain: String,
    pub mtu: u32,
}

/// Per-bridge state files
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub conf: PathBuf,
    pub pid: PathBuf,
    pub leases: PathBuf,
    pub log: PathBuf,
}

impl DaemonPaths {
    pub fn for_bridge(dir: &Path, bridge: &str) -> Self {
        Self {
            conf: dir.join(format!("{}.conf", bridge)),
            pid: dir.join(format!("{}.pid", bridge)),
            leases: dir.join(format!("{}.leases", bridge)),
            log: dir.join(format!("{}.log", bridge)),
        }
    }

    pub fn all(&self) -> [&PathBuf; 4] {
        [&self.conf, &self.pid, &self.leases, &self.log]
    }
}

#[async_trait]
pub trait DhcpDaemon: Send + Sync {
    /// Validate, launch and return the daemon PID
    async fn start(&self, config: &DhcpConfig) -> NetworkResult<u32>;
    /// SIGTERM, bounded wait, SIGKILL. An exited process is success.
    async fn stop(&self, pid: u32) -> NetworkResult<()>;
    /// Kill any daemon whose command line names this bridge's config
    async fn kill_by_bridge(&self, bridge: &str) -> NetworkResult<()>;
    async fn verify_running(&self, bridge: &str) -> bool;
    async fn verify_stopped(&self, bridge: &str) -> bool;
    fn pid_alive(&self, pid: u32) -> bool;
    async fn remove_files(&self, bridge: &str) -> NetworkResult<()>;
    async fn files_absent(&self, bridge: &str) -> bool;
    async fn status(&self, bridge: &str, expected_pid: Option<u32>) -> DaemonReport;

    /// Stop the known PID and anything else serving the bridge, then start fresh
    async fn restart(&self, old_pid: Option<u32>, config: &DhcpConfig) -> NetworkResult<u32> {
        if let Some(pid) = old_pid {
            if let Err(e) = self.stop(pid).await {
                tracing::warn!("Failed to stop dnsmasq pid {}: {}", pid, e);
            }
        }
        // Stored PID may be stale after a host reboot
        if let Err(e) = self.kill_by_bridge(&config.bridge).await {
            tracing::warn!("Fallback kill for {} failed: {}", config.bridge, e);
        }
        self.start(config).await
    }
}

/// Render a dnsmasq config. Returns the text and the NTP entries that were dropped.
pub fn render_config(config: &DhcpConfig, paths: &DaemonPaths) -> (String, Vec<String>) {
    let (ntp, rejected): (Vec<&String>, Vec<&String>) = config
        .ntp_servers
        .iter()
        .partition(|s| s.trim().parse::<Ipv4Addr>().is_ok());
    let rejected: Vec<String> = rejected.into_iter().cloned().collect();
    if !rejected.is_empty() {
        tracing::warn!(
            "Dropping non-IPv4 NTP servers for {} (option 42 carries addresses only): {}",
            config.bridge,
            rejected.join(", ")
        );
    }

    let mut dns: Vec<String> = Vec::new();
    for server in &config.dns_servers {
        if server.trim().parse::<Ipv4Addr>().is_ok() {
            dns.push(server.trim().to_string());
        } else {
            tracing::warn!("Ignoring invalid DNS server '{}' for {}", server, config.bridge);
        }
    }
    if dns.is_empty() {
        dns.push(config.gateway.to_string());
    }

    let mut conf = String::new();
    conf.push_str(&format!("# Managed by deptnet for {}\n", config.bridge));
    conf.push_str(&format!("interface={}\n", config.bridge));
    conf.push_str("except-interface=lo\n");
    conf.push_str("bind-interfaces\n");
    conf.push_str(&format!("pid-file={}\n", paths.pid.display()));
    conf.push_str(&format!("dhcp-leasefile={}\n", paths.leases.display()));
    conf.push_str(&format!("log-facility={}\n", paths.log.display()));
    conf.push_str("log-dhcp\n");
    conf.push_str("dhcp-authoritative\n");
    conf.push_str(&format!(
        "dhcp-range={},{},{},{}\n",
        config.range_start, config.range_end, config.netmask, DHCP_LEASE_TIME
    ));
    conf.push_str(&format!("dhcp-option=1,{}\n", config.netmask));
    conf.push_str(&format!("dhcp-option=3,{}\n", config.gateway));
    conf.push_str(&format!("dhcp-option=6,{}\n", dns.join(",")));
    conf.push_str(&format!("dhcp-option=15,{}\n", config.domain));
    conf.push_str(&format!("dhcp-option=26,{}\n", config.mtu));
    conf.push_str(&format!("dhcp-option=28,{}\n", config.broadcast));
    if !ntp.is_empty() {
        let ntp: Vec<&str> = ntp.iter().map(|s| s.trim()).collect();
        conf.push_str(&format!("dhcp-option=42,{}\n", ntp.join(",")));
    }

    (conf, rejected)
}

/// True if `ss -ulpn` output shows a UDP/67 socket (owned by `pid` when given)
pub fn ss_shows_dhcp_listener(output: &str, pid: Option<u32>) -> bool {
    let port_suffix = format!(":{}", DHCP_SERVER_PORT);
    output.lines().any(|line| {
        let on_port = line
            .split_whitespace()
            .any(|field| field.ends_with(&port_suffix));
        let owned = match pid {
            Some(pid) => line.contains(&format!("pid={},", pid)),
            None => line.contains("dnsmasq"),
        };
        on_port && owned
    })
}

fn lease_count(content: &str) -> usize {
    content.lines().filter(|l| !l.trim().is_empty()).count()
}

pub struct DnsmasqSupervisor {
    runner: Arc<dyn CommandRunner>,
    dnsmasq: String,
    state_dir: PathBuf,
    stop_grace: Duration,
    pid_file_wait: Duration,
}

impl DnsmasqSupervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &ReconcilerConfig) -> Self {
        Self {
            runner,
            dnsmasq: config.dnsmasq_bin.clone(),
            state_dir: config.dnsmasq_dir.clone(),
            stop_grace: config.stop_grace,
            pid_file_wait: config.pid_file_wait,
        }
    }

    pub fn paths(&self, bridge: &str) -> DaemonPaths {
        DaemonPaths::for_bridge(&self.state_dir, bridge)
    }

    /// Command-line pattern matching only this bridge's daemon
    fn process_pattern(&self, bridge: &str) -> String {
        format!("dnsmasq.*[/ ]{}\\.conf( |$)", bridge)
    }

    async fn read_pid_file(&self, path: &Path) -> NetworkResult<Option<u32>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => content
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| {
                    NetworkError::Process(format!(
                        "unparsable pid file {}: '{}'",
                        path.display(),
                        content.trim()
                    ))
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NetworkError::Io(e)),
        }
    }

    /// The daemon forks before writing its PID file; poll for it
    async fn wait_for_pid(&self, path: &Path) -> NetworkResult<u32> {
        let poll = Duration::from_millis(50);
        let mut waited = Duration::ZERO;
        loop {
            match self.read_pid_file(path).await {
                Ok(Some(pid)) => return Ok(pid),
                // Empty file: the daemon is mid-write
                Ok(None) | Err(NetworkError::Process(_)) if waited < self.pid_file_wait => {}
                Ok(None) => {
                    return Err(NetworkError::Timeout(format!(
                        "dnsmasq did not write {}",
                        path.display()
                    )))
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
    }

    async fn listening_on_dhcp(&self, pid: Option<u32>) -> bool {
        match self.runner.run("ss", &["-H", "-ulpn"]).await {
            Ok(result) if result.success => ss_shows_dhcp_listener(&result.stdout, pid),
            Ok(result) => {
                tracing::debug!("ss failed: {}", result.stderr.trim());
                false
            }
            Err(e) => {
                tracing::debug!("ss unavailable: {}", e);
                false
            }
        }
    }

    async fn pgrep(&self, bridge: &str) -> Option<bool> {
        let pattern = self.process_pattern(bridge);
        match self.runner.run("pgrep", &["-f", &pattern]).await {
            Ok(result) => match result.exit_code {
                Some(0) => Some(true),
                Some(1) => Some(false),
                _ => None,
            },
            Err(e) => {
                tracing::warn!("pgrep for {} failed: {}", bridge, e);
                None
            }
        }
    }
}

#[async_trait]
impl DhcpDaemon for DnsmasqSupervisor {
    async fn start(&self, config: &DhcpConfig) -> NetworkResult<u32> {
        let paths = self.paths(&config.bridge);
        let (conf, _) = render_config(config, &paths);

        tokio::fs::create_dir_all(&self.state_dir).await?;
        tokio::fs::write(&paths.conf, conf).await?;
        // A stale pid file would be read back as the new daemon
        FileSystemUtils::remove_file(&paths.pid)
            .await
            .map_err(NetworkError::Process)?;

        let conf_path = paths.conf.to_string_lossy().to_string();
        let check = self
            .runner
            .run(&self.dnsmasq, &["--test", "-C", &conf_path])
            .await?;
        if !check.success {
            return Err(NetworkError::Validation(format!(
                "dnsmasq rejected {}: {}",
                conf_path,
                check.stderr.trim()
            )));
        }

        run_checked(self.runner.as_ref(), &self.dnsmasq, &["-C", &conf_path]).await?;
        let pid = self.wait_for_pid(&paths.pid).await?;
        tracing::info!("dnsmasq for {} started with pid {}", config.bridge, pid);

        if !self.listening_on_dhcp(Some(pid)).await {
            tracing::warn!(
                "dnsmasq pid {} for {} is not visibly listening on udp/{}",
                pid,
                config.bridge,
                DHCP_SERVER_PORT
            );
        }
        if let Ok(content) = tokio::fs::read_to_string(&paths.leases).await {
            tracing::info!("{} active leases on {}", lease_count(&content), config.bridge);
        }

        Ok(pid)
    }

    async fn stop(&self, pid: u32) -> NetworkResult<()> {
        ProcessUtils::terminate_process(pid, self.stop_grace)
            .await
            .map_err(NetworkError::Process)
    }

    async fn kill_by_bridge(&self, bridge: &str) -> NetworkResult<()> {
        let pattern = self.process_pattern(bridge);
        let args = ["-KILL", "-f", pattern.as_str()];
        let result = self.runner.run("pkill", &args).await?;
        match result.exit_code {
            // 1 means nothing matched
            Some(0) | Some(1) => Ok(()),
            _ => Err(NetworkError::Command {
                cmd: render("pkill", &args),
                stderr: result.stderr.trim().to_string(),
            }),
        }
    }

    async fn verify_running(&self, bridge: &str) -> bool {
        self.pgrep(bridge).await == Some(true)
    }

    async fn verify_stopped(&self, bridge: &str) -> bool {
        self.pgrep(bridge).await == Some(false)
    }

    fn pid_alive(&self, pid: u32) -> bool {
        ProcessUtils::is_process_running(pid)
    }

    async fn remove_files(&self, bridge: &str) -> NetworkResult<()> {
        let paths = self.paths(bridge);
        let mut first_error = None;
        for path in paths.all() {
            if let Err(e) = FileSystemUtils::remove_file(path).await {
                tracing::warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(NetworkError::Process(e)),
            None => Ok(()),
        }
    }

    async fn files_absent(&self, bridge: &str) -> bool {
        for path in self.paths(bridge).all() {
            if FileSystemUtils::exists(path).await {
                return false;
            }
        }
        true
    }

    async fn status(&self, bridge: &str, expected_pid: Option<u32>) -> DaemonReport {
        let paths = self.paths(bridge);
        let pid_file_pid = self.read_pid_file(&paths.pid).await.ok().flatten();
        let pid_alive = expected_pid.map(ProcessUtils::is_process_running).unwrap_or(false);
        let leases = tokio::fs::read_to_string(&paths.leases)
            .await
            .map(|c| lease_count(&c))
            .unwrap_or(0);

        DaemonReport {
            running: self.verify_running(bridge).await,
            expected_pid,
            pid_file_pid,
            pid_alive,
            pid_matches: pid_alive && expected_pid.is_some() && expected_pid == pid_file_pid,
            config_present: FileSystemUtils::exists(&paths.conf).await,
            pid_file_present: FileSystemUtils::exists(&paths.pid).await,
            leases_present: FileSystemUtils::exists(&paths.leases).await,
            lease_count: leases,
            listening_port_67: self.listening_on_dhcp(expected_pid.or(pid_file_pid)).await,
            log_tail: FileSystemUtils::read_tail(&paths.log, LOG_TAIL_LINES).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{config_in, ScriptedRunner};
    use crate::utils::command::CommandResult;

    fn sample_config(ntp: &[&str]) -> DhcpConfig {
        DhcpConfig {
            bridge: "dept-acme01".to_string(),
            gateway: Ipv4Addr::new(10, 10, 5, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Ipv4Addr::new(10, 10, 5, 255),
            range_start: Ipv4Addr::new(10, 10, 5, 10),
            range_end: Ipv4Addr::new(10, 10, 5, 254),
            dns_servers: vec!["1.1.1.1".to_string()],
            ntp_servers: ntp.iter().map(|s| s.to_string()).collect(),
            domain: "dept.local".to_string(),
            mtu: 1450,
        }
    }

    #[test]
    fn test_ntp_hostnames_are_filtered() {
        let config = sample_config(&["10.0.0.1", "pool.ntp.org", "8.8.8.8"]);
        let paths = DaemonPaths::for_bridge(Path::new("/run/deptnet"), &config.bridge);
        let (conf, rejected) = render_config(&config, &paths);

        let option42: Vec<&str> = conf
            .lines()
            .filter(|l| l.starts_with("dhcp-option=42,"))
            .collect();
        assert_eq!(option42, vec!["dhcp-option=42,10.0.0.1,8.8.8.8"]);
        assert!(!conf.contains("pool.ntp.org"));
        assert_eq!(rejected, vec!["pool.ntp.org"]);
    }

    #[test]
    fn test_render_binds_single_interface() {
        let config = sample_config(&["ntp.example.com"]);
        let paths = DaemonPaths::for_bridge(Path::new("/run/deptnet"), &config.bridge);
        let (conf, _) = render_config(&config, &paths);

        assert_eq!(conf.lines().filter(|l| l.starts_with("interface=")).count(), 1);
        assert!(conf.contains("interface=dept-acme01\n"));
        assert!(conf.contains("except-interface=lo\n"));
        assert!(conf.contains("bind-interfaces\n"));
        assert!(conf.contains("dhcp-authoritative\n"));
        assert!(conf.contains("dhcp-range=10.10.5.10,10.10.5.254,255.255.255.0,4h\n"));
        assert!(conf.contains("dhcp-option=1,255.255.255.0\n"));
        assert!(conf.contains("dhcp-option=3,10.10.5.1\n"));
        assert!(conf.contains("dhcp-option=6,1.1.1.1\n"));
        assert!(conf.contains("dhcp-option=15,dept.local\n"));
        assert!(conf.contains("dhcp-option=26,1450\n"));
        assert!(conf.contains("dhcp-option=28,10.10.5.255\n"));
        // No valid NTP entries means no option 42 at all
        assert!(!conf.contains("dhcp-option=42"));
        assert!(conf.contains("pid-file=/run/deptnet/dept-acme01.pid\n"));
    }

    #[test]
    fn test_ss_listener_detection() {
        let output = "UNCONN 0 0 0.0.0.0%dept-acme01:67 0.0.0.0:* users:((\"dnsmasq\",pid=4242,fd=4))\n\
UNCONN 0 0 127.0.0.53%lo:53 0.0.0.0:* users:((\"systemd-resolve\",pid=1,fd=12))\n";
        assert!(ss_shows_dhcp_listener(output, Some(4242)));
        assert!(ss_shows_dhcp_listener(output, None));
        assert!(!ss_shows_dhcp_listener(output, Some(1)));
        assert!(!ss_shows_dhcp_listener("", None));
    }

    #[tokio::test]
    async fn test_validation_failure_does_not_launch() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_, args| {
            if args.contains(&"--test") {
                CommandResult::from_exit(1, "", "dnsmasq: bad option at line 12")
            } else {
                CommandResult::from_exit(0, "", "")
            }
        }));
        let supervisor = DnsmasqSupervisor::new(runner.clone(), &config_in(dir.path()));

        let err = supervisor.start(&sample_config(&[])).await.unwrap_err();
        assert!(matches!(err, NetworkError::Validation(_)));

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("dnsmasq --test -C"));
    }

    #[tokio::test]
    async fn test_start_reads_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let pid_path = config.dnsmasq_dir.join("dept-acme01.pid");
        let runner = Arc::new(ScriptedRunner::new(move |program, args| {
            if program == "dnsmasq" && args.first() == Some(&"-C") {
                std::fs::write(&pid_path, format!("{}\n", std::process::id())).unwrap();
            }
            CommandResult::from_exit(0, "", "")
        }));
        let supervisor = DnsmasqSupervisor::new(runner, &config);

        let pid = supervisor.start(&sample_config(&[])).await.unwrap();
        assert_eq!(pid, std::process::id());
        assert!(supervisor.paths("dept-acme01").conf.exists());
    }

    #[tokio::test]
    async fn test_start_rejects_garbage_pid() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let pid_path = config.dnsmasq_dir.join("dept-acme01.pid");
        let runner = Arc::new(ScriptedRunner::new(move |program, args| {
            if program == "dnsmasq" && args.first() == Some(&"-C") {
                std::fs::write(&pid_path, "not-a-pid\n").unwrap();
            }
            CommandResult::from_exit(0, "", "")
        }));
        let supervisor = DnsmasqSupervisor::new(runner, &config);

        let err = supervisor.start(&sample_config(&[])).await.unwrap_err();
        assert!(matches!(err, NetworkError::Process(_)));
    }

    #[tokio::test]
    async fn test_kill_by_bridge_tolerates_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_, _| CommandResult::from_exit(1, "", "")));
        let supervisor = DnsmasqSupervisor::new(runner.clone(), &config_in(dir.path()));

        supervisor.kill_by_bridge("dept-acme01").await.unwrap();
        assert!(supervisor.verify_stopped("dept-acme01").await);
        assert!(!supervisor.verify_running("dept-acme01").await);
        assert!(runner.calls()[0].contains("dept-acme01\\.conf"));
    }

    #[tokio::test]
    async fn test_remove_files() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            DnsmasqSupervisor::new(Arc::new(ScriptedRunner::ok()), &config_in(dir.path()));
        let paths = supervisor.paths("dept-acme01");
        std::fs::create_dir_all(dir.path().join("dnsmasq")).unwrap();
        for path in paths.all() {
            std::fs::write(path, "x").unwrap();
        }

        assert!(!supervisor.files_absent("dept-acme01").await);
        supervisor.remove_files("dept-acme01").await.unwrap();
        assert!(supervisor.files_absent("dept-acme01").await);
    }
}
