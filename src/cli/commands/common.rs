// Shared output helpers for command handlers

use deptnet::reconciler::TeardownReport;
use deptnet::store::TenantNetworkRecord;
use deptnet::utils::logger::Logger;
use deptnet::utils::process::ProcessUtils;
use serde::Serialize;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Print a value as pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn display_record(record: &TenantNetworkRecord) {
    Logger::detail("department", &format!("{} ({})", record.tenant_id, record.name));
    Logger::detail("subnet", record.subnet.as_deref().unwrap_or("-"));
    Logger::detail("bridge", record.bridge_name.as_deref().unwrap_or("-"));
    if let Some(gateway) = &record.gateway_ip {
        Logger::detail("gateway", gateway);
    }
    if let (Some(start), Some(end)) = (&record.dhcp_range_start, &record.dhcp_range_end) {
        Logger::detail("dhcp range", &format!("{} - {}", start, end));
    }
    if let Some(pid) = record.daemon_pid {
        Logger::detail("dnsmasq pid", &pid.to_string());
    }
    if !record.dns_servers.is_empty() {
        Logger::detail("dns", &record.dns_servers.join(", "));
    }
    if !record.ntp_servers.is_empty() {
        Logger::detail("ntp", &record.ntp_servers.join(", "));
    }
    Logger::detail("mtu", &record.effective_mtu().to_string());
    Logger::detail("updated", &ProcessUtils::format_timestamp(record.updated_at));
}

pub fn display_teardown(report: &TeardownReport) {
    let Some(bridge) = &report.bridge else {
        Logger::info(&format!("{} has no network, nothing to do", report.tenant_id));
        return;
    };

    Logger::section(&format!("Teardown of {} ({})", bridge, report.tenant_id));
    for step in &report.steps {
        let label = match (&step.error, step.attempted) {
            (_, false) => format!("{} (skipped)", step.step),
            (Some(e), true) => format!("{}: {}", step.step, e),
            (None, true) => step.step.clone(),
        };
        Logger::check(&label, step.success);
    }
}

/// Teardown with failed steps exits non-zero
pub fn teardown_result(report: &TeardownReport) -> CliResult {
    let failed = report.failures().len();
    if failed == 0 {
        Ok(())
    } else {
        Err(format!("{} of {} teardown steps failed", failed, report.steps.len()).into())
    }
}
