// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use tracing::{debug, error};

use super::constants::*;
use super::exec::Exec;
use super::{Error, RedirectConfig};
use crate::config::Role;

/// One iptables rule, pinned to its table and agent-owned chain.
#[derive(Clone, Debug)]
pub struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub args: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, chain: &'static str, args: &[&str]) -> Self {
        Rule {
            table,
            chain,
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Which built-in chains the agent hooks, per table.
const HOOKS: &[(&str, &str, &str)] = &[
    (TABLE_MANGLE, CHAIN_PREROUTING, CHAIN_ZTUNNEL_PREROUTING),
    (TABLE_MANGLE, CHAIN_INPUT, CHAIN_ZTUNNEL_INPUT),
    (TABLE_MANGLE, CHAIN_FORWARD, CHAIN_ZTUNNEL_FORWARD),
    (TABLE_MANGLE, CHAIN_OUTPUT, CHAIN_ZTUNNEL_OUTPUT),
    (TABLE_MANGLE, CHAIN_POSTROUTING, CHAIN_ZTUNNEL_POSTROUTING),
    (TABLE_NAT, CHAIN_PREROUTING, CHAIN_ZTUNNEL_PREROUTING),
    (TABLE_NAT, CHAIN_POSTROUTING, CHAIN_ZTUNNEL_POSTROUTING),
];

/// Installs and removes the agent-owned chain topology in `mangle` and
/// `nat`. Only chains with the `ztunnel-` prefix are ever touched; rules the
/// agent did not install are left alone.
pub struct Firewall {
    exec: Arc<dyn Exec>,
    cmd: String,
}

impl Firewall {
    pub fn new(exec: Arc<dyn Exec>, cmd: String) -> Self {
        Firewall { exec, cmd }
    }

    fn iptables(&self, args: &[&str]) -> Result<(), Error> {
        self.exec.run(&self.cmd, args)
    }

    /// Fail fast when iptables cannot be invoked at all.
    pub fn probe(&self) -> Result<(), Error> {
        self.exec
            .output(&self.cmd, &["-t", TABLE_MANGLE, "-S", CHAIN_OUTPUT])
            .map(|_| ())
            .map_err(|e| Error::NotCapable(e.to_string()))
    }

    /// The mangle OUTPUT jump is the install sentinel: if it exists the
    /// whole topology is assumed present and only needs a flush.
    pub fn jump_exists(&self) -> bool {
        self.iptables(&[
            "-t",
            TABLE_MANGLE,
            "-C",
            CHAIN_OUTPUT,
            "-j",
            CHAIN_ZTUNNEL_OUTPUT,
        ])
        .is_ok()
    }

    /// Create the agent chains and hook them from the built-ins.
    pub fn initialize(&self) -> Result<(), Error> {
        for (table, builtin, chain) in HOOKS {
            self.iptables(&["-t", table, "-N", chain])?;
            self.iptables(&["-t", table, "-A", builtin, "-j", chain])?;
        }
        Ok(())
    }

    /// Empty the agent chains, leaving the chains and jumps intact.
    pub fn flush(&self) {
        for (table, _, chain) in HOOKS {
            if let Err(e) = self.iptables(&["-t", table, "-F", chain]) {
                error!("failed to flush {table}/{chain}: {e}");
            }
        }
    }

    /// Flush-or-initialize, the reinstall-safe entrypoint.
    pub fn ensure_chains(&self) -> Result<(), Error> {
        if self.jump_exists() {
            debug!("chain {CHAIN_ZTUNNEL_OUTPUT} already exists, flushing");
            self.flush();
            Ok(())
        } else {
            debug!("initializing chains");
            self.initialize()
        }
    }

    /// Append rules in order. A failed rule is logged and does not stop the
    /// ones after it; the kernel sees rule N before rule N+1 is attempted.
    pub fn append(&self, rules: &[Rule]) {
        for rule in rules {
            let mut args: Vec<&str> = vec!["-t", rule.table, "-A", rule.chain];
            args.extend(rule.args.iter().map(|s| s.as_str()));
            if let Err(e) = self.iptables(&args) {
                error!("failed to append iptables rule: {e}");
            }
        }
    }

    /// Remove jumps, flush and delete the agent chains. Missing pieces are
    /// already-done work, not errors.
    pub fn teardown(&self) {
        for (table, builtin, chain) in HOOKS {
            let _ = self.iptables(&["-t", table, "-D", builtin, "-j", chain]);
            let _ = self.iptables(&["-t", table, "-F", chain]);
            let _ = self.iptables(&["-t", table, "-X", chain]);
        }
    }
}

/// Batch A: conntrack plumbing and fast accepts. Appended before the
/// classification batch.
pub fn conntrack_rules(cfg: &RedirectConfig, set_name: &str) -> Vec<Rule> {
    let mut rules = Vec::new();

    // Traffic arriving on our tunnel devices already carries the payload
    // mark; skip it without persisting to connmark.
    let skip_devices: &[&str] = match cfg.role {
        Role::Cpu => &[DPU_TUN],
        Role::Collapsed | Role::Dpu => &[INBOUND_TUN, OUTBOUND_TUN],
    };
    let skip = SKIP_MARK.to_string();
    for dev in skip_devices {
        rules.push(Rule::new(
            TABLE_MANGLE,
            CHAIN_ZTUNNEL_PREROUTING,
            &["-i", dev, "-j", "MARK", "--set-mark", &skip],
        ));
        rules.push(Rule::new(
            TABLE_MANGLE,
            CHAIN_ZTUNNEL_PREROUTING,
            &["-i", dev, "-j", "RETURN"],
        ));
    }

    // Whatever is skipped must be skipped for returning packets too: save the
    // skip decision to connmark. This happens after routing (FORWARD/INPUT),
    // so the saved bits survive NAT rewriting the tuple.
    let connskip = CONN_SKIP_MARK.to_string();
    let connskip_mask = format!("{CONN_SKIP_MASK:#x}");
    let proxy = PROXY_MARK.to_string();
    let proxy_mask = format!("{PROXY_MASK:#x}");
    for chain in [CHAIN_ZTUNNEL_FORWARD, CHAIN_ZTUNNEL_INPUT] {
        rules.push(Rule::new(
            TABLE_MANGLE,
            chain,
            &[
                "-m",
                "mark",
                "--mark",
                &connskip,
                "-j",
                "CONNMARK",
                "--save-mark",
                "--nfmask",
                &connskip_mask,
                "--ctmask",
                &connskip_mask,
            ],
        ));
    }
    // Proxy-marked flows need different routing only for their replies; the
    // saved proxy bits let PREROUTING recognize the return direction.
    for chain in [CHAIN_ZTUNNEL_FORWARD, CHAIN_ZTUNNEL_INPUT] {
        rules.push(Rule::new(
            TABLE_MANGLE,
            chain,
            &[
                "-m",
                "mark",
                "--mark",
                &proxy,
                "-j",
                "CONNMARK",
                "--save-mark",
                "--nfmask",
                &proxy_mask,
                "--ctmask",
                &proxy_mask,
            ],
        ));
    }

    // Host-originated traffic (kubelet probes and the like) never enters the
    // proxy path. The bare mask is stamped here: host traffic carries no
    // prior classification, so the whole mark is overwritten.
    let host_ip = cfg.host_ip.to_string();
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_OUTPUT,
        &["--source", &host_ip, "-j", "MARK", "--set-mark", &connskip_mask],
    ));

    // Flows already bound for the mesh proxy must not have their service VIP
    // rewritten by kube-proxy; accept before the nat chains see them.
    let outbound = OUTBOUND_MARK.to_string();
    for chain in [CHAIN_ZTUNNEL_PREROUTING, CHAIN_ZTUNNEL_POSTROUTING] {
        rules.push(Rule::new(
            TABLE_NAT,
            chain,
            &["-m", "mark", "--mark", &outbound, "-j", "ACCEPT"],
        ));
    }

    if cfg.capture_dns {
        let to = format!("{}:{}", cfg.ztunnel_ip, DNS_CAPTURE_PORT);
        rules.push(Rule::new(
            TABLE_NAT,
            CHAIN_ZTUNNEL_PREROUTING,
            &[
                "-p",
                "udp",
                "-m",
                "set",
                "--match-set",
                set_name,
                "src",
                "--dport",
                "53",
                "-j",
                "DNAT",
                "--to",
                &to,
            ],
        ));
    }

    rules
}

/// Batch B: classification proper, all in PREROUTING-mangle. The order is
/// the contract; do not reorder.
pub fn classification_rules(cfg: &RedirectConfig, set_name: &str) -> Vec<Rule> {
    let mut rules = Vec::new();
    let skip = SKIP_MARK.to_string();
    let connskip = CONN_SKIP_MARK.to_string();
    let proxy = PROXY_MARK.to_string();
    let proxy_ret = PROXY_RET_MARK.to_string();
    let outbound = OUTBOUND_MARK.to_string();
    let geneve_port = GENEVE_PORT.to_string();
    let ztunnel_ip = cfg.ztunnel_ip.to_string();
    let proxy_iface = cfg.proxy_iface.as_str();

    // 1. The tunnel copies the mark onto the decapsulated packet; leave the
    //    encapsulated one alone.
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_PREROUTING,
        &[
            "-p", "udp", "-m", "udp", "--dport", &geneve_port, "-j", "RETURN",
        ],
    ));

    // 2./3. Restore a saved skip decision so the other side of the
    //       connection is skipped as well.
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_PREROUTING,
        &[
            "-m",
            "connmark",
            "--mark",
            &connskip,
            "-j",
            "MARK",
            "--set-mark",
            &skip,
        ],
    ));
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_PREROUTING,
        &["-m", "mark", "--mark", &skip, "-j", "RETURN"],
    ));

    // 4./5. Replies of proxy original-source flows get the return mark so
    //       they are routed back to the proxy.
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_PREROUTING,
        &[
            "!",
            "-i",
            proxy_iface,
            "-m",
            "connmark",
            "--mark",
            &proxy,
            "-j",
            "MARK",
            "--set-mark",
            &proxy_ret,
        ],
    ));
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_PREROUTING,
        &["-m", "mark", "--mark", &proxy_ret, "-j", "RETURN"],
    ));

    // 6. Original-source packets leaving the proxy may carry a pod source
    //    IP; mark them so they are not steered back into the proxy. On the
    //    CPU node only destinations in the membership set qualify.
    match cfg.role {
        Role::Cpu => rules.push(Rule::new(
            TABLE_MANGLE,
            CHAIN_ZTUNNEL_PREROUTING,
            &[
                "-i",
                proxy_iface,
                "!",
                "--source",
                &ztunnel_ip,
                "-m",
                "set",
                "--match-set",
                set_name,
                "dst",
                "-j",
                "MARK",
                "--set-mark",
                &proxy,
            ],
        )),
        Role::Collapsed | Role::Dpu => rules.push(Rule::new(
            TABLE_MANGLE,
            CHAIN_ZTUNNEL_PREROUTING,
            &[
                "-i",
                proxy_iface,
                "!",
                "--source",
                &ztunnel_ip,
                "-j",
                "MARK",
                "--set-mark",
                &proxy,
            ],
        )),
    }
    // 7. Re-check: anything the proxy rule above left skipped still returns.
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_PREROUTING,
        &["-m", "mark", "--mark", &skip, "-j", "RETURN"],
    ));

    // 8. Everything else leaving the proxy (xds, peer ztunnels, upstream
    //    pods) routes normally.
    match cfg.role {
        Role::Cpu => rules.push(Rule::new(
            TABLE_MANGLE,
            CHAIN_ZTUNNEL_PREROUTING,
            &[
                "-i",
                proxy_iface,
                "-m",
                "set",
                "--match-set",
                set_name,
                "dst",
                "-j",
                "MARK",
                "--set-mark",
                &connskip,
            ],
        )),
        Role::Collapsed | Role::Dpu => rules.push(Rule::new(
            TABLE_MANGLE,
            CHAIN_ZTUNNEL_PREROUTING,
            &[
                "-i",
                proxy_iface,
                "-j",
                "MARK",
                "--set-mark",
                &connskip,
            ],
        )),
    }

    // 9. Skip UDP so DNS keeps working.
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_PREROUTING,
        &["-p", "udp", "-j", "MARK", "--set-mark", &connskip],
    ));

    // 10. Skip anything carrying the skip mark; port exclusions and the like
    //     hook in by setting it earlier.
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_PREROUTING,
        &["-m", "mark", "--mark", &skip, "-j", "RETURN"],
    ));

    // 11. TCP from a member pod is an outbound mesh flow.
    rules.push(Rule::new(
        TABLE_MANGLE,
        CHAIN_ZTUNNEL_PREROUTING,
        &[
            "-p",
            "tcp",
            "-m",
            "set",
            "--match-set",
            set_name,
            "src",
            "-j",
            "MARK",
            "--set-mark",
            &outbound,
        ],
    ));

    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::kernel::FakeKernel;
    use crate::test_helpers::redirect_config;

    fn firewall() -> (Arc<FakeKernel>, Firewall) {
        let kernel = Arc::new(FakeKernel::new());
        let fw = Firewall::new(kernel.clone(), "iptables".to_string());
        (kernel, fw)
    }

    fn install(fw: &Firewall, cfg: &RedirectConfig) {
        fw.ensure_chains().unwrap();
        fw.append(&conntrack_rules(cfg, IPSET_NAME));
        fw.append(&classification_rules(cfg, IPSET_NAME));
    }

    #[test]
    fn skip_return_precedes_outbound_stamp() {
        for role in [Role::Collapsed, Role::Cpu, Role::Dpu] {
            let cfg = redirect_config(role);
            let rules = classification_rules(&cfg, IPSET_NAME);
            let rendered: Vec<String> = rules.iter().map(|r| r.args.join(" ")).collect();
            let skip_ret = rendered
                .iter()
                .position(|r| r.contains("--mark 0x539/0xfff -j RETURN"))
                .unwrap();
            let outbound = rendered
                .iter()
                .position(|r| r.contains(&format!("--set-mark {OUTBOUND_MARK}")))
                .unwrap();
            assert!(skip_ret < outbound, "role {role:?}");
        }
    }

    #[test]
    fn cpu_and_dpu_proxy_rules_differ_by_set_match() {
        let cpu = classification_rules(&redirect_config(Role::Cpu), IPSET_NAME);
        let dpu = classification_rules(&redirect_config(Role::Dpu), IPSET_NAME);
        let cpu_proxy = cpu
            .iter()
            .find(|r| r.args.join(" ").contains(&format!("--set-mark {PROXY_MARK}")))
            .unwrap();
        let dpu_proxy = dpu
            .iter()
            .find(|r| r.args.join(" ").contains(&format!("--set-mark {PROXY_MARK}")))
            .unwrap();
        assert!(cpu_proxy.args.join(" ").contains("--match-set"));
        assert!(!dpu_proxy.args.join(" ").contains("--match-set"));
    }

    #[test]
    fn dns_capture_rule_follows_flag() {
        let mut cfg = redirect_config(Role::Collapsed);
        cfg.capture_dns = true;
        let with = conntrack_rules(&cfg, IPSET_NAME);
        assert!(with.iter().any(|r| {
            r.table == TABLE_NAT
                && r.args.join(" ")
                    == format!(
                        "-p udp -m set --match-set {IPSET_NAME} src --dport 53 -j DNAT --to {}:{DNS_CAPTURE_PORT}",
                        cfg.ztunnel_ip
                    )
        }));
        cfg.capture_dns = false;
        let without = conntrack_rules(&cfg, IPSET_NAME);
        assert!(!without.iter().any(|r| r.args.join(" ").contains("DNAT")));
    }

    #[test]
    fn reinstall_flushes_instead_of_duplicating() {
        let (kernel, fw) = firewall();
        let cfg = redirect_config(Role::Collapsed);
        install(&fw, &cfg);
        let first = kernel.iptables_save();
        install(&fw, &cfg);
        assert_eq!(first, kernel.iptables_save());
    }

    #[test]
    fn teardown_removes_agent_chains_only() {
        let (kernel, fw) = firewall();
        // a foreign rule the agent must not touch
        kernel
            .run(
                "iptables",
                &["-t", TABLE_NAT, "-A", CHAIN_POSTROUTING, "-j", "MASQUERADE"],
            )
            .unwrap();
        let cfg = redirect_config(Role::Collapsed);
        install(&fw, &cfg);
        fw.teardown();
        let dump = kernel.iptables_save();
        assert!(!dump.contains("ztunnel-"));
        assert!(dump.contains("MASQUERADE"));
        // a second teardown is a no-op, not an error
        fw.teardown();
    }

    #[test]
    fn host_output_rule_sets_the_bare_connskip_mask() {
        let cfg = redirect_config(Role::Collapsed);
        let rules = conntrack_rules(&cfg, IPSET_NAME);
        // the whole mark is overwritten with the mask value, not OR'd under it
        assert!(rules.iter().any(|r| {
            r.chain == CHAIN_ZTUNNEL_OUTPUT
                && r.args.join(" ")
                    == format!(
                        "--source {} -j MARK --set-mark {CONN_SKIP_MASK:#x}",
                        cfg.host_ip
                    )
        }));
    }
}
