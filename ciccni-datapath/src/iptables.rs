//! Host packet-forwarding rules for pod-to-external traffic.
//!
//! Two agent-owned chains are installed on top of the standard tables:
//!
//! - `CICCNI-FORWARD` in `filter`: marks traffic leaving the pod gateway
//!   toward other interfaces with 0x40/0x40 and accepts pod<->external
//!   traffic in both directions.
//! - `CICCNI-POSTROUTING` in `nat`: masquerades packets carrying the mark on
//!   their way out the node's default interface.
//!
//! Every step is ensure-style (create chain if missing, append rule if
//! missing), so repeated bootstraps leave the tables unchanged.

use tracing::{debug, info};

use crate::error::{DatapathError, Result};

const FILTER_TABLE: &str = "filter";
const NAT_TABLE: &str = "nat";

const FORWARD_CHAIN: &str = "FORWARD";
const POSTROUTING_CHAIN: &str = "POSTROUTING";

const CICCNI_FORWARD_CHAIN: &str = "CICCNI-FORWARD";
const CICCNI_POSTROUTING_CHAIN: &str = "CICCNI-POSTROUTING";

const POD_TRAFFIC_MARK: &str = "0x40/0x40";

/// Installs the fixed forwarding/masquerade rule set.
#[derive(Debug, Clone)]
pub struct IptablesClient {
    host_gateway: String,
}

impl IptablesClient {
    pub fn new(host_gateway: impl Into<String>) -> Self {
        Self {
            host_gateway: host_gateway.into(),
        }
    }

    /// Ensure all chains and rules exist. `out_interface` is the node's
    /// default outbound interface; masquerading is scoped to it.
    pub async fn setup_host_forwarding(&self, out_interface: &str) -> Result<()> {
        let gateway = self.host_gateway.clone();
        let out = out_interface.to_string();
        // The iptables crate shells out synchronously.
        tokio::task::spawn_blocking(move || setup_rules(&gateway, &out))
            .await
            .map_err(|e| DatapathError::Internal(e.to_string()))?
    }
}

fn setup_rules(gateway: &str, out_interface: &str) -> Result<()> {
    let ipt = ::iptables::new(false).map_err(|e| DatapathError::Iptables(e.to_string()))?;

    ensure_chain(&ipt, FILTER_TABLE, CICCNI_FORWARD_CHAIN)?;
    ensure_chain(&ipt, NAT_TABLE, CICCNI_POSTROUTING_CHAIN)?;

    for (table, chain, rule) in rule_set(gateway, out_interface) {
        ensure_rule(&ipt, table, chain, &rule)?;
    }

    info!(gateway, out_interface, "Installed host forwarding rules");
    Ok(())
}

/// The complete ordered rule set, as (table, chain, rule-spec) triples.
/// Comments are single tokens; the iptables crate splits rule specs on
/// whitespace.
fn rule_set(gateway: &str, out_interface: &str) -> Vec<(&'static str, &'static str, String)> {
    vec![
        (
            FILTER_TABLE,
            FORWARD_CHAIN,
            format!("-m comment --comment ciccni-forward-rules -j {CICCNI_FORWARD_CHAIN}"),
        ),
        (
            FILTER_TABLE,
            CICCNI_FORWARD_CHAIN,
            format!(
                "-i {gateway} ! -o {gateway} -m comment --comment ciccni-mark-pod-egress \
                 -j MARK --set-xmark {POD_TRAFFIC_MARK}"
            ),
        ),
        (
            FILTER_TABLE,
            CICCNI_FORWARD_CHAIN,
            format!(
                "-i {gateway} ! -o {gateway} -m comment --comment ciccni-pod-to-external -j ACCEPT"
            ),
        ),
        (
            FILTER_TABLE,
            CICCNI_FORWARD_CHAIN,
            format!(
                "! -i {gateway} -o {gateway} -m comment --comment ciccni-external-to-pod -j ACCEPT"
            ),
        ),
        (
            FILTER_TABLE,
            CICCNI_FORWARD_CHAIN,
            "-m comment --comment ciccni-default-accept -j ACCEPT".to_string(),
        ),
        (
            NAT_TABLE,
            POSTROUTING_CHAIN,
            format!("-m comment --comment ciccni-postrouting-rules -j {CICCNI_POSTROUTING_CHAIN}"),
        ),
        (
            NAT_TABLE,
            CICCNI_POSTROUTING_CHAIN,
            format!(
                "-o {out_interface} -m mark --mark {POD_TRAFFIC_MARK} \
                 -m comment --comment ciccni-masquerade -j MASQUERADE"
            ),
        ),
    ]
}

/// Create the chain if it does not exist yet.
fn ensure_chain(ipt: &::iptables::IPTables, table: &str, chain: &str) -> Result<()> {
    let chains = ipt
        .list_chains(table)
        .map_err(|e| DatapathError::Iptables(format!("listing chains in {table}: {e}")))?;
    if chains.iter().any(|c| c == chain) {
        return Ok(());
    }
    ipt.new_chain(table, chain)
        .map_err(|e| DatapathError::Iptables(format!("creating chain {chain} in {table}: {e}")))?;
    debug!(table, chain, "Created iptables chain");
    Ok(())
}

/// Append the rule if it does not exist yet.
fn ensure_rule(ipt: &::iptables::IPTables, table: &str, chain: &str, rule: &str) -> Result<()> {
    let exists = ipt.exists(table, chain, rule).map_err(|e| {
        DatapathError::Iptables(format!("checking rule in {table}/{chain}: {e}"))
    })?;
    if exists {
        return Ok(());
    }
    ipt.append(table, chain, rule).map_err(|e| {
        DatapathError::Iptables(format!("appending rule to {table}/{chain}: {e}"))
    })?;
    debug!(table, chain, rule, "Appended iptables rule");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_set_marks_and_masquerades() {
        let rules = rule_set("gw0", "eth0");

        let jump = &rules[0];
        assert_eq!(jump.0, "filter");
        assert_eq!(jump.1, "FORWARD");
        assert!(jump.2.ends_with("-j CICCNI-FORWARD"));

        let mark = &rules[1];
        assert!(mark.2.starts_with("-i gw0 ! -o gw0"));
        assert!(mark.2.contains("--set-xmark 0x40/0x40"));

        let masq = rules.last().unwrap();
        assert_eq!(masq.0, "nat");
        assert_eq!(masq.1, "CICCNI-POSTROUTING");
        assert!(masq.2.contains("-o eth0"));
        assert!(masq.2.contains("--mark 0x40/0x40"));
        assert!(masq.2.ends_with("-j MASQUERADE"));
    }

    #[test]
    fn comments_are_single_tokens() {
        for (_, _, rule) in rule_set("gw0", "eth0") {
            let mut words = rule.split_whitespace().peekable();
            while let Some(word) = words.next() {
                if word == "--comment" {
                    let comment = words.peek().expect("comment value present");
                    assert!(!comment.contains('"'));
                }
            }
        }
    }
}
