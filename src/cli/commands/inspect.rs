// Diagnose and capture handlers

use super::common::{print_json, CliResult};
use deptnet::diagnostics::{CaptureResult, DiagnosticReport};
use deptnet::reconciler::Reconciler;
use deptnet::utils::logger::Logger;
use deptnet::utils::process::ProcessUtils;

pub async fn handle_diagnose(reconciler: &Reconciler, tenant_id: &str, json: bool) -> CliResult {
    let report = reconciler.diagnose(tenant_id).await?;
    if json {
        return print_json(&report);
    }
    display_report(&report);
    Ok(())
}

fn display_report(report: &DiagnosticReport) {
    Logger::section(&format!("Diagnostics for {}", report.tenant_id));
    Logger::detail("subnet", report.subnet.as_deref().unwrap_or("-"));
    Logger::detail("generated", &ProcessUtils::format_timestamp(report.generated_at));

    let bridge = &report.bridge;
    Logger::section(&format!("Bridge {}", bridge.name));
    if let Some(owner) = &report.bridge_owner {
        Logger::detail("owned by", owner);
    }
    Logger::check("exists", bridge.exists);
    if bridge.exists {
        Logger::check("up", bridge.is_up);
        if let Some(expected) = &bridge.expected_address {
            Logger::check(&format!("gateway {}", expected), bridge.has_gateway());
        }
        if let Some(mtu) = bridge.mtu {
            Logger::check(
                &format!("mtu {} (expected {})", mtu, bridge.expected_mtu),
                mtu == bridge.expected_mtu,
            );
        }
        if !bridge.ports.is_empty() {
            Logger::detail("ports", &bridge.ports.join(", "));
        }
    }

    let daemon = &report.daemon;
    Logger::section("dnsmasq");
    Logger::check("running", daemon.running);
    Logger::check("stored pid alive", daemon.pid_alive);
    Logger::check("pid file matches record", daemon.pid_matches);
    Logger::check("listening on udp/67", daemon.listening_port_67);
    Logger::check("config present", daemon.config_present);
    Logger::detail("leases", &daemon.lease_count.to_string());

    let kernel = &report.kernel;
    Logger::section("Kernel");
    Logger::check("br_netfilter loaded", kernel.module_loaded);
    for sysctl in &kernel.sysctls {
        let value = sysctl.value.as_deref().unwrap_or("unreadable");
        Logger::check(&format!("{} = {}", sysctl.key, value), value == "0");
    }
    Logger::check("sysctl drop-in", kernel.dropin_present);
    Logger::check("module autoload", kernel.autoload_present);

    let nat = &report.nat;
    Logger::section("NAT");
    Logger::check("masquerade rule", nat.rule_exists);
    Logger::check("forward rules", nat.forward_rules_exist);
    if let Some(forwarding) = nat.ip_forward_enabled {
        Logger::check("ip_forward", forwarding);
    }

    if !report.taps.is_empty() {
        Logger::section("TAP devices");
        for tap in &report.taps {
            let owner = match (&tap.owner_name, tap.owner_pid) {
                (Some(name), Some(pid)) => format!("{} (pid {})", name, pid),
                _ => "no owner".to_string(),
            };
            Logger::check(&format!("{}: {}", tap.name, owner), !tap.orphan);
        }
    }

    if report.drifted {
        Logger::warning("Actual state has drifted from the record");
    } else {
        Logger::success("No drift detected");
    }

    if !report.recommendations.is_empty() {
        Logger::section("Recommendations");
        for rec in &report.recommendations {
            Logger::item(rec);
        }
    }

    Logger::section("Manual commands");
    for cmd in &report.manual_commands {
        Logger::item(cmd);
    }
}

pub async fn handle_capture(
    reconciler: &Reconciler,
    tenant_id: &str,
    seconds: u64,
    json: bool,
) -> CliResult {
    if !json {
        Logger::info(&format!("Capturing DHCP traffic of {} for {}s", tenant_id, seconds));
    }
    let result = reconciler.capture_traffic(tenant_id, seconds).await?;
    if json {
        return print_json(&result);
    }
    display_capture(&result);
    Ok(())
}

fn display_capture(result: &CaptureResult) {
    for line in &result.lines {
        println!("{}", line);
    }
    if result.truncated {
        Logger::warning("Output truncated");
    }

    let s = &result.summary;
    Logger::section(&format!("{} packets on {}", s.total_packets, result.interface));
    Logger::detail("discover", &s.discover.to_string());
    Logger::detail("offer", &s.offer.to_string());
    Logger::detail("request", &s.request.to_string());
    Logger::detail("ack", &s.ack.to_string());
    Logger::detail("nak", &s.nak.to_string());
    if s.discover > 0 && s.offer == 0 {
        Logger::warning("Clients are asking but dnsmasq never offered; run deptnet diagnose");
    }
}
