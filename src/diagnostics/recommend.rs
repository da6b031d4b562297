use crate::diagnostics::report::DiagnosticReport;
use crate::network::dhcp::DaemonPaths;
use crate::utils::constants::BRIDGE_NF_SYSCTLS;

/// Desired state (record) and observed state disagree.
///
/// A configured department needs its bridge, gateway address, a live daemon
/// and the masquerade rule. An unconfigured one must have none of its
/// bridge or daemon left behind, unless that bridge is another department's.
pub fn is_drifted(report: &DiagnosticReport) -> bool {
    if report.bridge_owner.is_some() {
        false
    } else if report.configured {
        !report.bridge.exists
            || !report.bridge.has_gateway()
            || !(report.daemon.running && report.daemon.pid_alive)
            || !report.nat.rule_exists
    } else {
        report.bridge.exists || report.daemon.running
    }
}

/// Operator-facing advice derived from the typed sub-reports
pub fn recommendations(report: &DiagnosticReport) -> Vec<String> {
    let mut recs = Vec::new();
    let bridge = &report.bridge;
    let name = bridge.name.as_str();

    if let Some(owner) = &report.bridge_owner {
        recs.push(format!(
            "{} belongs to department {}; {} has no network of its own to clean up",
            name, owner, report.tenant_id
        ));
        return recs;
    }

    if !report.configured {
        if bridge.exists || report.daemon.running {
            recs.push(format!(
                "Department has no network on record but {} is still present; run `deptnet force-destroy {}`",
                name, report.tenant_id
            ));
        }
        return recs;
    }

    if !bridge.exists {
        recs.push(format!(
            "Bridge {} does not exist; run `deptnet restore` to re-provision it",
            name
        ));
    } else {
        if !bridge.is_up {
            recs.push(format!("Bridge {} is down; run `ip link set {} up`", name, name));
        }
        if let Some(expected) = &bridge.expected_address {
            if !bridge.has_gateway() {
                recs.push(format!(
                    "Gateway {} is missing; run `ip addr add {} dev {}`",
                    expected, expected, name
                ));
            }
        }
        if let Some(mtu) = bridge.mtu {
            if mtu != bridge.expected_mtu {
                recs.push(format!(
                    "Bridge MTU is {} but {} is configured; run `ip link set {} mtu {}`",
                    mtu, bridge.expected_mtu, name, bridge.expected_mtu
                ));
            }
        }
    }

    let daemon = &report.daemon;
    if !daemon.running {
        recs.push(format!(
            "dnsmasq is not running for {}; run `deptnet restart-dhcp {}`",
            name, report.tenant_id
        ));
    } else {
        if !daemon.pid_matches {
            recs.push(
                "Stored dnsmasq PID does not match the live daemon; restart it to resync the record"
                    .to_string(),
            );
        }
        if !daemon.listening_port_67 {
            recs.push(format!(
                "dnsmasq for {} is not listening on udp/67; check its log tail",
                name
            ));
        }
    }
    if !daemon.config_present {
        recs.push(format!("dnsmasq config for {} is missing; restart the daemon", name));
    }

    let kernel = &report.kernel;
    if !kernel.module_loaded {
        recs.push("br_netfilter is not loaded; run `modprobe br_netfilter`".to_string());
    }
    if !kernel.bridge_nf_disabled() {
        let keys: Vec<String> = BRIDGE_NF_SYSCTLS
            .iter()
            .map(|k| format!("{}=0", k.replace('/', ".")))
            .collect();
        recs.push(format!(
            "Bridged traffic still goes through netfilter and DHCP broadcasts may be dropped; run `sysctl -w {}`",
            keys.join(" ")
        ));
    }
    if !kernel.dropin_present || !kernel.autoload_present {
        recs.push(
            "Kernel settings are not persisted and will be lost on reboot; run `deptnet restore`"
                .to_string(),
        );
    }

    let nat = &report.nat;
    if !nat.rule_exists {
        match &report.subnet {
            Some(subnet) => recs.push(format!(
                "Masquerade rule is missing; run `iptables -t nat -A POSTROUTING -s {} ! -o {} -j MASQUERADE`",
                subnet, name
            )),
            None => recs.push("Masquerade rule is missing".to_string()),
        }
    }
    if nat.ip_forward_enabled == Some(false) {
        recs.push("IP forwarding is disabled; run `sysctl -w net.ipv4.ip_forward=1`".to_string());
    }

    for tap in report.taps.iter().filter(|t| t.orphan) {
        recs.push(format!(
            "TAP {} is orphaned (persistent, no carrier, no owner); run `ip link delete {}`",
            tap.name, tap.name
        ));
    }

    recs
}

/// Literal commands an operator can paste to dig further
pub fn manual_commands(bridge: &str, subnet: Option<&str>, paths: &DaemonPaths) -> Vec<String> {
    let mut cmds = vec![
        format!("ip -d link show {}", bridge),
        format!("ip addr show dev {}", bridge),
        format!("bridge link show master {}", bridge),
        format!("pgrep -af 'dnsmasq.*{}.conf'", bridge),
        "ss -ulpn 'sport = :67'".to_string(),
        format!("cat {}", paths.conf.display()),
        format!("cat {}", paths.leases.display()),
        format!("tail -n 50 {}", paths.log.display()),
        "lsmod | grep br_netfilter".to_string(),
        format!(
            "sysctl {}",
            BRIDGE_NF_SYSCTLS
                .iter()
                .map(|k| k.replace('/', "."))
                .collect::<Vec<_>>()
                .join(" ")
        ),
        "sysctl net.ipv4.ip_forward".to_string(),
        "iptables -t nat -S POSTROUTING".to_string(),
        "iptables -S FORWARD".to_string(),
    ];
    if let Some(subnet) = subnet {
        cmds.push(format!(
            "iptables -t nat -C POSTROUTING -s {} ! -o {} -j MASQUERADE",
            subnet, bridge
        ));
    }
    cmds.push(format!("tcpdump -n -v -i {} udp port 67 or udp port 68", bridge));
    cmds
}
