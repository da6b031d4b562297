// DHCP packet capture on a department bridge
// tcpdump is read incrementally and hard-stopped at the deadline.

use crate::network::error::{NetworkError, NetworkResult};
use crate::utils::process::ProcessUtils;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;

const DHCP_FILTER: &str = "udp port 67 or udp port 68";
/// Time allowed for tcpdump to flush and exit after SIGTERM
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_MAX_LINES: usize = 5000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSummary {
    pub total_packets: usize,
    pub discover: usize,
    pub offer: usize,
    pub request: usize,
    pub ack: usize,
    pub nak: usize,
    pub other: usize,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub interface: String,
    pub lines: Vec<String>,
    /// More lines arrived than were kept
    pub truncated: bool,
    pub summary: CaptureSummary,
}

#[async_trait]
pub trait TrafficCapture: Send + Sync {
    /// Capture DHCP traffic on `interface` for exactly `duration`
    async fn capture(&self, interface: &str, duration: Duration) -> NetworkResult<CaptureResult>;
}

/// Splits a byte stream into lines, keeping partial lines between reads
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim_end().to_string();
        self.pending.clear();
        Some(rest).filter(|s| !s.is_empty())
    }
}

/// Counts packets and DHCP message types from `tcpdump -v` output.
///
/// Each packet has exactly one `BOOTP/DHCP` summary line; its type comes from
/// the `DHCP-Message (53)` option line that follows.
#[derive(Debug, Default)]
pub struct PacketTally {
    summary: CaptureSummary,
    untyped: bool,
}

impl PacketTally {
    pub fn feed(&mut self, line: &str) {
        if line.contains("BOOTP/DHCP") {
            self.close_packet();
            self.summary.total_packets += 1;
            self.untyped = true;
            return;
        }

        if self.untyped && line.contains("DHCP-Message") {
            let kind = line
                .rsplit(':')
                .next()
                .map(|k| k.trim().to_ascii_lowercase())
                .unwrap_or_default();
            match kind.as_str() {
                "discover" => self.summary.discover += 1,
                "offer" => self.summary.offer += 1,
                "request" => self.summary.request += 1,
                "ack" => self.summary.ack += 1,
                "nak" => self.summary.nak += 1,
                _ => self.summary.other += 1,
            }
            self.untyped = false;
        }
    }

    fn close_packet(&mut self) {
        if self.untyped {
            self.summary.other += 1;
            self.untyped = false;
        }
    }

    pub fn finish(mut self, duration: Duration) -> CaptureSummary {
        self.close_packet();
        self.summary.duration_secs = duration.as_secs();
        self.summary
    }
}

pub struct TcpdumpCapture {
    tcpdump: String,
    max_lines: usize,
}

impl TcpdumpCapture {
    pub fn new(tcpdump: &str) -> Self {
        Self {
            tcpdump: tcpdump.to_string(),
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

#[async_trait]
impl TrafficCapture for TcpdumpCapture {
    async fn capture(&self, interface: &str, duration: Duration) -> NetworkResult<CaptureResult> {
        let mut child = tokio::process::Command::new(&self.tcpdump)
            .args(["-l", "-n", "-v", "-i", interface, DHCP_FILTER])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(NetworkError::Io)?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| NetworkError::Process("tcpdump stdout not captured".to_string()))?;
        let mut stderr = child.stderr.take();
        let pid = child.id();
        tracing::info!("Capturing DHCP on {} for {}s", interface, duration.as_secs());

        let deadline = tokio::time::Instant::now() + duration;
        let mut assembler = LineAssembler::default();
        let mut tally = PacketTally::default();
        let mut lines = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 4096];
        // Set once SIGTERM is sent; bounds the whole drain, not each read
        let mut drain_deadline: Option<tokio::time::Instant> = None;
        let mut exited_early = false;

        loop {
            let terminated = drain_deadline.is_some();
            let until = drain_deadline.unwrap_or(deadline);
            let read = tokio::time::timeout_at(until, stdout.read(&mut buf)).await;

            match read {
                Ok(Ok(0)) => {
                    exited_early = !terminated;
                    break;
                }
                Ok(Ok(n)) => {
                    for line in assembler.push(&buf[..n]) {
                        tally.feed(&line);
                        keep(&mut lines, &mut truncated, line, self.max_lines);
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!("Reading tcpdump output failed: {}", e);
                    break;
                }
                Err(_) if !terminated => {
                    if let Some(pid) = pid {
                        if let Err(e) = ProcessUtils::send_signal(pid, Signal::SIGTERM) {
                            tracing::debug!("{}", e);
                        }
                    }
                    drain_deadline = Some(tokio::time::Instant::now() + DRAIN_GRACE);
                }
                Err(_) => break,
            }
        }

        if let Some(rest) = assembler.finish() {
            tally.feed(&rest);
            keep(&mut lines, &mut truncated, rest, self.max_lines);
        }

        let status = match tokio::time::timeout(DRAIN_GRACE, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                let _ = child.kill().await;
                None
            }
        };

        let summary = tally.finish(duration);
        if exited_early && summary.total_packets == 0 {
            if let Some(status) = status.filter(|s| !s.success()) {
                let mut err = String::new();
                if let Some(stderr) = stderr.as_mut() {
                    let _ = stderr.read_to_string(&mut err).await;
                }
                return Err(NetworkError::Command {
                    cmd: format!("{} -i {} {}", self.tcpdump, interface, DHCP_FILTER),
                    stderr: format!("exit {}: {}", status, err.trim()),
                });
            }
        }

        tracing::info!(
            "Capture on {} finished: {} packets ({} discover, {} offer, {} request, {} ack)",
            interface,
            summary.total_packets,
            summary.discover,
            summary.offer,
            summary.request,
            summary.ack
        );

        Ok(CaptureResult {
            interface: interface.to_string(),
            lines,
            truncated,
            summary,
        })
    }
}

fn keep(lines: &mut Vec<String>, truncated: &mut bool, line: String, max: usize) {
    if line.is_empty() {
        return;
    }
    if lines.len() < max {
        lines.push(line);
    } else {
        *truncated = true;
    }
}
