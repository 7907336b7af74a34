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
use super::exec::{set_accept_local, set_rp_filter, Exec};
use super::{Error, RedirectConfig};
use crate::config::Role;

/// One geneve endpoint: fixed name, VNI and local address, remote pinned to
/// the proxy or the paired node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: &'static str,
    pub vni: u32,
    pub local: &'static str,
    pub remote: Ipv4Addr,
}

/// The geneve links carrying mesh traffic between this node and the proxy
/// (and, in split mode, between the CPU and DPU nodes).
pub struct Tunnels {
    exec: Arc<dyn Exec>,
}

/// Which links this role owns.
pub fn tunnel_specs(cfg: &RedirectConfig) -> Result<Vec<TunnelSpec>, Error> {
    let mut specs = Vec::new();
    match cfg.role {
        Role::Collapsed | Role::Dpu => {
            specs.push(TunnelSpec {
                name: INBOUND_TUN,
                vni: INBOUND_TUN_VNI,
                local: INBOUND_TUN_IP,
                remote: cfg.ztunnel_ip,
            });
            specs.push(TunnelSpec {
                name: OUTBOUND_TUN,
                vni: OUTBOUND_TUN_VNI,
                local: OUTBOUND_TUN_IP,
                remote: cfg.ztunnel_ip,
            });
            if cfg.role == Role::Dpu {
                specs.push(TunnelSpec {
                    name: CPU_TUN,
                    vni: CROSS_NODE_TUN_VNI,
                    local: DPU_CPU_TUN_IP,
                    remote: cfg.peer_ip.ok_or_else(|| {
                        Error::NoNodePair("dpu node has no paired cpu node".to_string())
                    })?,
                });
            }
        }
        Role::Cpu => {
            specs.push(TunnelSpec {
                name: DPU_TUN,
                vni: CROSS_NODE_TUN_VNI,
                local: CPU_DPU_TUN_IP,
                remote: cfg.peer_ip.ok_or_else(|| {
                    Error::NoNodePair("cpu node has no paired dpu node".to_string())
                })?,
            });
        }
    }
    Ok(specs)
}

impl Tunnels {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Tunnels { exec }
    }

    fn ip(&self, args: &[&str]) -> Result<(), Error> {
        self.exec.run("ip", args)
    }

    fn exists_is_ok(result: Result<(), Error>) -> Result<(), Error> {
        match result {
            Err(Error::Command { ref stderr, .. }) if stderr.contains("File exists") => Ok(()),
            other => other,
        }
    }

    /// Build every link this role owns: create, address, bring up, then
    /// loosen the reverse-path check on it. A link left over from a previous
    /// run is reused as-is.
    pub fn install(&self, cfg: &RedirectConfig) -> Result<(), Error> {
        for spec in tunnel_specs(cfg)? {
            debug!(name = spec.name, vni = spec.vni, remote = %spec.remote, "building tunnel");
            let vni = spec.vni.to_string();
            let remote = spec.remote.to_string();
            if let Err(e) = Self::exists_is_ok(self.ip(&[
                "link", "add", spec.name, "type", "geneve", "id", &vni, "remote", &remote,
            ])) {
                error!("failed to add tunnel {}: {e}", spec.name);
            }
            let local = format!("{}/{TUN_PREFIX}", spec.local);
            if let Err(e) =
                Self::exists_is_ok(self.ip(&["addr", "add", &local, "dev", spec.name]))
            {
                error!("failed to add tunnel {} address: {e}", spec.name);
            }
            if let Err(e) = self.ip(&["link", "set", spec.name, "up"]) {
                error!("failed to set tunnel {} up: {e}", spec.name);
            }
            if let Err(e) = set_rp_filter(self.exec.as_ref(), spec.name, "0") {
                error!("failed to disable rp_filter on {}: {e}", spec.name);
            }
            if let Err(e) = set_accept_local(self.exec.as_ref(), spec.name, "1") {
                error!("failed to enable accept_local on {}: {e}", spec.name);
            }
        }
        Ok(())
    }

    /// Delete this role's links. Missing links are already-done work.
    pub fn teardown(&self, cfg: &RedirectConfig) {
        let specs = match tunnel_specs(cfg) {
            Ok(specs) => specs,
            Err(e) => {
                warn!("cannot enumerate tunnels for teardown: {e}");
                return;
            }
        };
        for spec in specs {
            if let Err(e) = self.ip(&["link", "del", spec.name]) {
                warn!("error deleting tunnel {}: {e}", spec.name);
            }
        }
    }

    /// Loosen reverse-path filtering node-wide: the sentinels, the
    /// proxy-facing interface, and every interface present at startup.
    /// Asymmetric tunnel paths would otherwise be dropped as martians,
    /// notably on AWS.
    pub fn tune_sysctls(&self, cfg: &RedirectConfig) {
        for dev in ["default", "all", cfg.proxy_iface.as_str()] {
            if let Err(e) = set_rp_filter(self.exec.as_ref(), dev, "0") {
                error!("failed to write rp_filter for {dev}: {e}");
            }
        }
        if let Err(e) = set_accept_local(self.exec.as_ref(), &cfg.proxy_iface, "1") {
            error!("failed to write accept_local for {}: {e}", cfg.proxy_iface);
        }
        match self.exec.ipv4_conf_entries() {
            Ok(entries) => {
                for dev in entries {
                    if let Err(e) = set_rp_filter(self.exec.as_ref(), &dev, "0") {
                        error!("failed to set rp_filter for {dev}: {e}");
                    }
                }
            }
            Err(e) => error!("failed to read ipv4 conf entries: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::kernel::FakeKernel;
    use crate::test_helpers::redirect_config;

    fn tunnels() -> (Arc<FakeKernel>, Tunnels) {
        let kernel = Arc::new(FakeKernel::new());
        let t = Tunnels::new(kernel.clone());
        (kernel, t)
    }

    #[test]
    fn collapsed_builds_inbound_and_outbound() {
        let (kernel, t) = tunnels();
        let cfg = redirect_config(Role::Collapsed);
        t.install(&cfg).unwrap();
        let links = kernel.links();
        assert_eq!(links.len(), 2);
        let inbound = links.iter().find(|l| l.name == INBOUND_TUN).unwrap();
        assert_eq!(inbound.vni, INBOUND_TUN_VNI);
        assert_eq!(inbound.remote, cfg.ztunnel_ip.to_string());
        assert!(inbound.up);
        assert!(inbound.addrs.contains(&format!("{INBOUND_TUN_IP}/{TUN_PREFIX}")));
        let outbound = links.iter().find(|l| l.name == OUTBOUND_TUN).unwrap();
        assert_eq!(outbound.vni, OUTBOUND_TUN_VNI);
        assert_eq!(
            kernel.sysctl(&format!("net.ipv4.conf.{INBOUND_TUN}.rp_filter")),
            Some("0".to_string())
        );
        assert_eq!(
            kernel.sysctl(&format!("net.ipv4.conf.{OUTBOUND_TUN}.accept_local")),
            Some("1".to_string())
        );
    }

    #[test]
    fn cpu_node_builds_only_the_cross_node_tunnel() {
        let (kernel, t) = tunnels();
        let cfg = redirect_config(Role::Cpu);
        t.install(&cfg).unwrap();
        let links = kernel.links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, DPU_TUN);
        assert_eq!(links[0].remote, cfg.peer_ip.unwrap().to_string());
        assert!(links[0].addrs.contains(&format!("{CPU_DPU_TUN_IP}/{TUN_PREFIX}")));
    }

    #[test]
    fn dpu_node_adds_the_cpu_tunnel() {
        let (kernel, t) = tunnels();
        let cfg = redirect_config(Role::Dpu);
        t.install(&cfg).unwrap();
        let names: Vec<_> = kernel.links().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec![INBOUND_TUN, OUTBOUND_TUN, CPU_TUN]);
    }

    #[test]
    fn split_mode_requires_a_pair() {
        let mut cfg = redirect_config(Role::Cpu);
        cfg.peer_ip = None;
        assert!(tunnel_specs(&cfg).is_err());
    }

    #[test]
    fn reinstall_and_double_teardown_are_clean() {
        let (kernel, t) = tunnels();
        let cfg = redirect_config(Role::Collapsed);
        t.install(&cfg).unwrap();
        t.install(&cfg).unwrap();
        assert_eq!(kernel.links().len(), 2);
        t.teardown(&cfg);
        assert!(kernel.links().is_empty());
        t.teardown(&cfg);
    }

    #[test]
    fn sysctl_sweep_covers_existing_interfaces() {
        let (kernel, t) = tunnels();
        let cfg = redirect_config(Role::Collapsed);
        t.tune_sysctls(&cfg);
        assert_eq!(
            kernel.sysctl("net.ipv4.conf.all.rp_filter"),
            Some("0".to_string())
        );
        assert_eq!(
            kernel.sysctl("net.ipv4.conf.default.rp_filter"),
            Some("0".to_string())
        );
        // eth0 is part of the fake's seeded conf entries
        assert_eq!(
            kernel.sysctl("net.ipv4.conf.eth0.rp_filter"),
            Some("0".to_string())
        );
        assert_eq!(
            kernel.sysctl(&format!("net.ipv4.conf.{}.accept_local", cfg.proxy_iface)),
            Some("1".to_string())
        );
    }
}
