// Department record handlers
// Stand in for the control plane that normally owns tenant rows.

use super::common::{print_json, CliResult};
use deptnet::reconciler::Reconciler;
use deptnet::utils::logger::Logger;

pub async fn handle_add(
    reconciler: &Reconciler,
    tenant_id: &str,
    name: Option<String>,
    json: bool,
) -> CliResult {
    let name = name.unwrap_or_else(|| tenant_id.to_string());
    let record = reconciler.add_department(tenant_id, &name).await?;
    if json {
        return print_json(&record);
    }
    Logger::success(&format!("Department {} registered", tenant_id));
    Ok(())
}

pub async fn handle_remove(reconciler: &Reconciler, tenant_id: &str, json: bool) -> CliResult {
    if let Err(e) = reconciler.remove_department(tenant_id).await {
        Logger::error_with_hint(
            &e.to_string(),
            &format!("run `deptnet destroy {}` first if it still has a network", tenant_id),
        );
        return Err(e.into());
    }
    if json {
        return print_json(&serde_json::json!({ "removed": tenant_id }));
    }
    Logger::success(&format!("Department {} removed", tenant_id));
    Ok(())
}

pub async fn handle_list(reconciler: &Reconciler, json: bool) -> CliResult {
    let records = reconciler.list_departments().await?;
    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        Logger::info("No departments registered");
        return Ok(());
    }

    println!(
        "{:<20} {:<20} {:<18} {:<16} {:>8}",
        "DEPARTMENT", "NAME", "SUBNET", "BRIDGE", "PID"
    );
    for r in &records {
        println!(
            "{:<20} {:<20} {:<18} {:<16} {:>8}",
            r.tenant_id,
            r.name,
            r.subnet.as_deref().unwrap_or("-"),
            r.bridge_name.as_deref().unwrap_or("-"),
            r.daemon_pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

pub async fn handle_next_subnet(reconciler: &Reconciler, json: bool) -> CliResult {
    let subnet = reconciler.planner().next_free().await?;
    if json {
        return print_json(&serde_json::json!({ "subnet": subnet }));
    }
    Logger::detail("next free subnet", &subnet);
    Ok(())
}
