use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct ProcessUtils;

impl ProcessUtils {
    /// Convert a stored PID to nix::Pid
    pub fn to_pid(pid: u32) -> Pid {
        Pid::from_raw(pid as i32)
    }

    /// Check if a process is still running
    pub fn is_process_running(pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        match signal::kill(Self::to_pid(pid), None) {
            Ok(()) => true,
            // Exists but owned by someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Gracefully terminate a process with SIGTERM, then SIGKILL if needed.
    /// A process that is already gone counts as terminated.
    pub async fn terminate_process(pid: u32, grace: Duration) -> Result<(), String> {
        if !Self::is_process_running(pid) {
            return Ok(());
        }

        match signal::kill(Self::to_pid(pid), Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => return Err(format!("Failed to send SIGTERM to process {}: {}", pid, e)),
        }

        let poll = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < grace {
            tokio::time::sleep(poll).await;
            waited += poll;
            if !Self::is_process_running(pid) {
                return Ok(());
            }
        }

        match signal::kill(Self::to_pid(pid), Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => return Err(format!("Failed to send SIGKILL to process {}: {}", pid, e)),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        if Self::is_process_running(pid) {
            return Err(format!("Process {} refused to die even after SIGKILL", pid));
        }
        Ok(())
    }

    /// Send a signal to a process
    pub fn send_signal(pid: u32, signal: Signal) -> Result<(), String> {
        signal::kill(Self::to_pid(pid), signal)
            .map_err(|e| format!("Failed to send signal {:?} to process {}: {}", signal, pid, e))
    }

    /// Get current timestamp in seconds since Unix epoch
    pub fn get_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Format timestamp as human-readable string
    pub fn format_timestamp(timestamp: i64) -> String {
        match chrono::DateTime::from_timestamp(timestamp, 0) {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => format!("timestamp: {}", timestamp),
        }
    }
}
