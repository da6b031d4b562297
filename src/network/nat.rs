use crate::diagnostics::report::NatReport;
use crate::network::error::{NetworkError, NetworkResult};
use crate::utils::command::{render, CommandRunner};
use crate::utils::constants::{IP_FORWARD_SYSCTL, NAT_COMMENT_PREFIX};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Masquerade and forwarding rules for department bridges.
///
/// All removals are idempotent.
#[async_trait]
pub trait NatOps: Send + Sync {
    /// One-time host setup (IP forwarding)
    async fn initialize(&self) -> NetworkResult<()>;
    async fn add_masquerade(&self, bridge: &str, subnet: &str) -> NetworkResult<()>;
    async fn remove_masquerade(&self, bridge: &str, subnet: &str) -> NetworkResult<()>;
    /// Delete every rule tagged with the bridge, whatever subnet it names.
    /// Returns how many rules were removed.
    async fn remove_all_for_bridge(&self, bridge: &str) -> NetworkResult<usize>;
    async fn masquerade_exists(&self, bridge: &str, subnet: &str) -> NetworkResult<bool>;
    async fn inspect(&self, bridge: &str, subnet: &str) -> NatReport;
}

/// iptables implementation. Every rule carries a `deptnet:<bridge>` comment.
pub struct IptablesNat {
    runner: Arc<dyn CommandRunner>,
    iptables: String,
    proc_sys_root: PathBuf,
}

/// One rule in the form iptables expects after `-A/-C/-D <chain>`
struct Rule {
    table: &'static str,
    chain: &'static str,
    spec: Vec<String>,
    /// Insert at the head of the chain instead of appending
    insert: bool,
}

pub fn rule_tag(bridge: &str) -> String {
    format!("{}{}", NAT_COMMENT_PREFIX, bridge)
}

impl IptablesNat {
    pub fn new(runner: Arc<dyn CommandRunner>, iptables: &str, proc_sys_root: PathBuf) -> Self {
        Self {
            runner,
            iptables: iptables.to_string(),
            proc_sys_root,
        }
    }

    fn rules(bridge: &str, subnet: &str) -> Vec<Rule> {
        let tag = rule_tag(bridge);
        let with_tag = |parts: &[&str]| -> Vec<String> {
            let mut spec: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
            spec.extend(["-m", "comment", "--comment", tag.as_str()].iter().map(|s| s.to_string()));
            spec
        };

        let mut masq = with_tag(&["-s", subnet, "!", "-o", bridge]);
        masq.extend(["-j".to_string(), "MASQUERADE".to_string()]);
        let mut fwd_in = with_tag(&["-i", bridge]);
        fwd_in.extend(["-j".to_string(), "ACCEPT".to_string()]);
        let mut fwd_out = with_tag(&["-o", bridge]);
        fwd_out.extend(["-j".to_string(), "ACCEPT".to_string()]);

        vec![
            Rule {
                table: "nat",
                chain: "POSTROUTING",
                spec: masq,
                insert: false,
            },
            Rule {
                table: "filter",
                chain: "FORWARD",
                spec: fwd_in,
                insert: true,
            },
            Rule {
                table: "filter",
                chain: "FORWARD",
                spec: fwd_out,
                insert: true,
            },
        ]
    }

    async fn iptables(
        &self,
        table: &str,
        op: &str,
        chain: &str,
        spec: &[String],
    ) -> NetworkResult<bool> {
        let mut args: Vec<&str> = vec!["-w", "-t", table, op, chain];
        if op == "-I" {
            args.push("1");
        }
        args.extend(spec.iter().map(String::as_str));
        let result = self.runner.run(&self.iptables, &args).await?;
        Ok(result.success)
    }

    async fn rule_present(&self, rule: &Rule) -> NetworkResult<bool> {
        self.iptables(rule.table, "-C", rule.chain, &rule.spec).await
    }

    async fn list_table(&self, table: &str) -> NetworkResult<String> {
        let args = ["-w", "-t", table, "-S"];
        let result = self.runner.run(&self.iptables, &args).await?;
        if !result.success {
            return Err(NetworkError::Command {
                cmd: render(&self.iptables, &args),
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result.stdout)
    }

    async fn ip_forward_enabled(&self) -> Option<bool> {
        let path = self.proc_sys_root.join(IP_FORWARD_SYSCTL);
        tokio::fs::read_to_string(&path)
            .await
            .ok()
            .map(|v| v.trim() == "1")
    }
}

#[async_trait]
impl NatOps for IptablesNat {
    async fn initialize(&self) -> NetworkResult<()> {
        let path = self.proc_sys_root.join(IP_FORWARD_SYSCTL);
        tokio::fs::write(&path, "1\n").await.map_err(NetworkError::Io)?;
        tracing::info!("IP forwarding enabled");
        Ok(())
    }

    async fn add_masquerade(&self, bridge: &str, subnet: &str) -> NetworkResult<()> {
        for rule in Self::rules(bridge, subnet) {
            if self.rule_present(&rule).await? {
                continue;
            }
            let op = if rule.insert { "-I" } else { "-A" };
            if !self.iptables(rule.table, op, rule.chain, &rule.spec).await? {
                return Err(NetworkError::Command {
                    cmd: format!(
                        "{} -t {} {} {} {}",
                        self.iptables,
                        rule.table,
                        op,
                        rule.chain,
                        rule.spec.join(" ")
                    ),
                    stderr: "rule insertion rejected".to_string(),
                });
            }
        }
        tracing::info!("NAT rules added for {} ({})", bridge, subnet);
        Ok(())
    }

    async fn remove_masquerade(&self, bridge: &str, subnet: &str) -> NetworkResult<()> {
        for rule in Self::rules(bridge, subnet) {
            // Duplicates are possible after manual edits; delete until gone
            let mut guard = 0;
            while self.rule_present(&rule).await? && guard < 8 {
                self.iptables(rule.table, "-D", rule.chain, &rule.spec).await?;
                guard += 1;
            }
        }
        Ok(())
    }

    async fn remove_all_for_bridge(&self, bridge: &str) -> NetworkResult<usize> {
        let mut removed = 0;
        for table in ["nat", "filter"] {
            let listing = self.list_table(table).await?;
            for (chain, spec) in tagged_rules(&listing, bridge) {
                match self.iptables(table, "-D", &chain, &spec).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {
                        tracing::warn!("Could not delete {} rule in {}/{}", bridge, table, chain)
                    }
                    Err(e) => tracing::warn!(
                        "Failed to delete {} rule in {}/{}: {}",
                        bridge,
                        table,
                        chain,
                        e
                    ),
                }
            }
        }
        Ok(removed)
    }

    async fn masquerade_exists(&self, bridge: &str, subnet: &str) -> NetworkResult<bool> {
        let rules = Self::rules(bridge, subnet);
        match rules.first() {
            Some(masq) => self.rule_present(masq).await,
            None => Ok(false),
        }
    }

    async fn inspect(&self, bridge: &str, subnet: &str) -> NatReport {
        let table_exists = self.list_table("nat").await.is_ok();
        let chain_exists = matches!(
            self.runner
                .run(&self.iptables, &["-w", "-t", "nat", "-S", "POSTROUTING"])
                .await,
            Ok(ref r) if r.success
        );

        let mut rule_exists = false;
        let mut forward_rules_exist = true;
        for (i, rule) in Self::rules(bridge, subnet).iter().enumerate() {
            let present = self.rule_present(rule).await.unwrap_or(false);
            if i == 0 {
                rule_exists = present;
            } else {
                forward_rules_exist &= present;
            }
        }

        NatReport {
            rule_exists,
            table_exists,
            chain_exists,
            forward_rules_exist,
            ip_forward_enabled: self.ip_forward_enabled().await,
        }
    }
}

/// Rules in an `iptables -S` listing tagged for `bridge`, as (chain, spec) ready for `-D`
pub fn tagged_rules(listing: &str, bridge: &str) -> Vec<(String, Vec<String>)> {
    let tag = rule_tag(bridge);
    listing
        .lines()
        .filter_map(|line| {
            let tokens: Vec<String> = line
                .split_whitespace()
                .map(|t| t.trim_matches('"').to_string())
                .collect();
            if tokens.first().map(String::as_str) != Some("-A") || tokens.len() < 2 {
                return None;
            }
            if !tokens.iter().any(|t| *t == tag) {
                return None;
            }
            Some((tokens[1].clone(), tokens[2..].to_vec()))
        })
        .collect()
}
