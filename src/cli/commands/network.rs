// Network lifecycle command handlers
// Configure, Destroy, ForceDestroy, Restore, RestartDaemon and settings updates.

use super::common::{display_record, display_teardown, print_json, teardown_result, CliResult};
use deptnet::config::parse_list;
use deptnet::reconciler::{DhcpSettings, Reconciler};
use deptnet::utils::logger::Logger;

pub async fn handle_configure(
    reconciler: &Reconciler,
    tenant_id: &str,
    subnet: Option<String>,
    json: bool,
) -> CliResult {
    if !json {
        Logger::info(&format!("Configuring network for {}", tenant_id));
    }
    let record = reconciler.configure(tenant_id, subnet.as_deref()).await?;

    if json {
        return print_json(&record);
    }
    Logger::success(&format!(
        "Department {} is on {}",
        tenant_id,
        record.subnet.as_deref().unwrap_or("-")
    ));
    display_record(&record);
    Ok(())
}

pub async fn handle_destroy(
    reconciler: &Reconciler,
    tenant_id: &str,
    force: bool,
    json: bool,
) -> CliResult {
    let report = if force {
        reconciler.force_destroy(tenant_id).await?
    } else {
        reconciler.destroy(tenant_id).await?
    };

    if json {
        print_json(&report)?;
    } else {
        display_teardown(&report);
        if report.all_succeeded() && report.bridge.is_some() {
            Logger::success(&format!("Network of {} removed", tenant_id));
        }
    }
    teardown_result(&report)
}

pub async fn handle_restore(reconciler: &Reconciler, json: bool) -> CliResult {
    let summary = reconciler.restore_all().await;

    if json {
        print_json(&summary)?;
    } else {
        Logger::section("Restore");
        for tenant in &summary.restored {
            Logger::check(&format!("{}: re-provisioned", tenant), true);
        }
        for tenant in &summary.repaired {
            Logger::check(&format!("{}: repaired", tenant), true);
        }
        for tenant in &summary.healthy {
            Logger::check(&format!("{}: healthy", tenant), true);
        }
        for (tenant, error) in &summary.failed {
            Logger::check(&format!("{}: {}", tenant, error), false);
        }
        if summary.total() == 0 {
            Logger::info("No department networks on record");
        }
    }

    if summary.failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} department network(s) failed to restore", summary.failed.len()).into())
    }
}

pub async fn handle_restart_dhcp(
    reconciler: &Reconciler,
    tenant_id: &str,
    json: bool,
) -> CliResult {
    let pid = reconciler.restart_daemon(tenant_id).await?;
    if json {
        return print_json(&serde_json::json!({ "tenant_id": tenant_id, "pid": pid }));
    }
    Logger::success(&format!("dnsmasq for {} restarted", tenant_id));
    Logger::detail("pid", &pid.to_string());
    Ok(())
}

pub async fn handle_settings(
    reconciler: &Reconciler,
    tenant_id: &str,
    dns: Option<String>,
    ntp: Option<String>,
    mtu: Option<u32>,
    default_mtu: bool,
    json: bool,
) -> CliResult {
    let settings = DhcpSettings {
        dns_servers: dns.as_deref().map(parse_list),
        ntp_servers: ntp.as_deref().map(parse_list),
        mtu: if default_mtu { Some(None) } else { mtu.map(Some) },
    };
    if settings == DhcpSettings::default() {
        return Err("nothing to change: pass --dns, --ntp, --mtu or --default-mtu".into());
    }

    let record = reconciler.update_settings(tenant_id, settings).await?;
    if json {
        return print_json(&record);
    }
    Logger::success(&format!("Settings of {} updated", tenant_id));
    display_record(&record);
    Ok(())
}
