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

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::constants::*;
use super::exec::Exec;
use super::{Error, RedirectConfig};
use crate::config::Role;

/// The three agent-owned routing tables and the four policy rules selecting
/// them by fwmark. The Inbound table deliberately has no default route: a
/// miss falls through to the main table.
pub struct Routes {
    exec: Arc<dyn Exec>,
}

impl Routes {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Routes { exec }
    }

    fn ip(&self, args: &[&str]) -> Result<(), Error> {
        self.exec.run("ip", args)
    }

    pub fn probe(&self) -> Result<(), Error> {
        self.exec
            .output("ip", &["-V"])
            .map(|_| ())
            .map_err(|e| Error::NotCapable(e.to_string()))
    }

    /// Install the per-role table contents and the policy rules. Individual
    /// failures are logged; later entries are still attempted.
    pub fn install(&self, cfg: &RedirectConfig) {
        for route in base_routes(cfg) {
            let mut args = vec!["route", "add"];
            args.extend(route.iter().map(|s| s.as_str()));
            if let Err(e) = self.ip(&args) {
                error!("failed to add route ({}): {e}", route.join(" "));
            }
        }
        for (priority, spec) in policy_rules(cfg.role) {
            // Repeated installs replace the agent's rule at this priority
            // rather than stacking a second copy.
            let priority = priority.to_string();
            let _ = self.ip(&["rule", "del", "priority", &priority]);
            let mut args = vec!["rule", "add", "priority", priority.as_str()];
            args.extend(spec.iter().map(|s| s.as_str()));
            if let Err(e) = self.ip(&args) {
                error!("failed to add rule priority {priority}: {e}");
            }
        }
    }

    /// Remove the policy rules and empty all three tables.
    pub fn teardown(&self) {
        for priority in [
            RULE_PRIORITY_SKIP,
            RULE_PRIORITY_OUTBOUND,
            RULE_PRIORITY_PROXY_RET,
            RULE_PRIORITY_INBOUND,
        ] {
            let priority = priority.to_string();
            if let Err(e) = self.ip(&["rule", "del", "priority", &priority]) {
                warn!("error removing rule priority {priority}: {e}");
            }
        }
        for table in [
            ROUTE_TABLE_INBOUND,
            ROUTE_TABLE_OUTBOUND,
            ROUTE_TABLE_PROXY,
        ] {
            let table = table.to_string();
            if let Err(e) = self.ip(&["route", "flush", "table", &table]) {
                warn!("error flushing table {table}: {e}");
            }
        }
    }

    /// The textual presence check: exactly one line of `ip route show`
    /// output for the given spec means the route exists. Route objects built
    /// by hand have been rejected by the kernel with EINVAL, so the string
    /// form stays authoritative.
    pub fn route_exists(&self, route: &[String]) -> bool {
        let mut args = vec!["route", "show"];
        args.extend(route.iter().map(|s| s.as_str()));
        match self.exec.output("ip", &args) {
            Ok(out) => {
                debug!("route_exists({}): {out}", route.join(" "));
                out.lines().count() == 1
            }
            Err(_) => false,
        }
    }

    pub fn add_route(&self, route: &[String]) -> Result<(), Error> {
        let mut args = vec!["route", "add"];
        args.extend(route.iter().map(|s| s.as_str()));
        self.ip(&args)
    }

    pub fn del_route(&self, route: &[String]) -> Result<(), Error> {
        let mut args = vec!["route", "del"];
        args.extend(route.iter().map(|s| s.as_str()));
        self.ip(&args)
    }

    /// The device the main table would use to reach `ip`; pods are reached
    /// through their veth, which needs rp_filter off.
    pub fn device_for(&self, ip: Ipv4Addr) -> Result<String, Error> {
        let ip = ip.to_string();
        let out = self.exec.output("ip", &["route", "get", &ip])?;
        let mut tokens = out.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "dev" {
                if let Some(dev) = tokens.next() {
                    return Ok(dev.to_string());
                }
            }
        }
        Err(Error::NoRoute(ip))
    }
}

/// The Inbound-table /32 steering a member pod's traffic into the inbound
/// tunnel, with the host IP pinned as source.
pub fn pod_route(pod_ip: Ipv4Addr, host_ip: Ipv4Addr) -> Vec<String> {
    vec![
        "table".to_string(),
        ROUTE_TABLE_INBOUND.to_string(),
        format!("{pod_ip}/32"),
        "via".to_string(),
        ZTUNNEL_INBOUND_TUN_IP.to_string(),
        "dev".to_string(),
        INBOUND_TUN.to_string(),
        "src".to_string(),
        host_ip.to_string(),
    ]
}

fn route(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|s| s.to_string()).collect()
}

/// Per-role table contents, added at install time. Per-pod Inbound routes
/// come and go with the reconciler instead.
fn base_routes(cfg: &RedirectConfig) -> Vec<Vec<String>> {
    let outbound = ROUTE_TABLE_OUTBOUND.to_string();
    let proxy = ROUTE_TABLE_PROXY.to_string();
    let inbound = ROUTE_TABLE_INBOUND.to_string();
    let ztunnel_ip = cfg.ztunnel_ip.to_string();
    match cfg.role {
        Role::Collapsed | Role::Dpu => {
            let veth = cfg.proxy_iface.as_str();
            vec![
                route(&[
                    "table", &outbound, &ztunnel_ip, "dev", veth, "scope", "link",
                ]),
                route(&[
                    "table",
                    &outbound,
                    "0.0.0.0/0",
                    "via",
                    ZTUNNEL_OUTBOUND_TUN_IP,
                    "dev",
                    OUTBOUND_TUN,
                ]),
                route(&["table", &proxy, &ztunnel_ip, "dev", veth, "scope", "link"]),
                // Replies with the proxy return mark always go back through
                // the proxy, even though the veth has no such subnet.
                route(&[
                    "table",
                    &proxy,
                    "0.0.0.0/0",
                    "via",
                    &ztunnel_ip,
                    "dev",
                    veth,
                    "onlink",
                ]),
                route(&["table", &inbound, &ztunnel_ip, "dev", veth, "scope", "link"]),
            ]
        }
        Role::Cpu => {
            let peer = cfg
                .peer_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default();
            vec![
                route(&[
                    "table",
                    &outbound,
                    "0.0.0.0/0",
                    "via",
                    DPU_CPU_TUN_IP,
                    "dev",
                    DPU_TUN,
                ]),
                route(&[
                    "table",
                    &proxy,
                    "0.0.0.0/0",
                    "via",
                    &peer,
                    "dev",
                    &cfg.proxy_iface,
                ]),
            ]
        }
    }
}

/// Priority → rule spec. The unconditional Inbound lookup only exists where
/// the inbound tunnel terminates locally.
fn policy_rules(role: Role) -> Vec<(u32, Vec<String>)> {
    let mut rules = vec![
        (
            RULE_PRIORITY_SKIP,
            route(&["fwmark", &SKIP_MARK.to_string(), "goto", &TABLE_MAIN.to_string()]),
        ),
        (
            RULE_PRIORITY_OUTBOUND,
            route(&[
                "fwmark",
                &OUTBOUND_MARK.to_string(),
                "lookup",
                &ROUTE_TABLE_OUTBOUND.to_string(),
            ]),
        ),
        (
            RULE_PRIORITY_PROXY_RET,
            route(&[
                "fwmark",
                &PROXY_RET_MARK.to_string(),
                "lookup",
                &ROUTE_TABLE_PROXY.to_string(),
            ]),
        ),
    ];
    if role != Role::Cpu {
        rules.push((
            RULE_PRIORITY_INBOUND,
            route(&["table", &ROUTE_TABLE_INBOUND.to_string()]),
        ));
    }
    rules
}
