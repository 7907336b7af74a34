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

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::exec::{set_rp_filter, Exec};
use super::ipset::Ipset;
use super::iptables::{classification_rules, conntrack_rules, Firewall};
use super::routes::{pod_route, Routes};
use super::tunnel::Tunnels;
use super::{Error, RedirectConfig};
use crate::metrics::redirect::{EventOp, Metrics};
use crate::pods::{PodDescriptor, PodEvent};

/// Drives the membership set, classifier, route steering and tunnel fabric
/// from pod lifecycle events. All kernel mutations happen on this single
/// task; event producers feel backpressure through the bounded channel.
pub struct Reconciler {
    cfg: RedirectConfig,
    ipset: Ipset,
    firewall: Firewall,
    routes: Routes,
    tunnels: Tunnels,
    exec: Arc<dyn Exec>,
    metrics: Arc<Metrics>,
    /// uid → redirected IP, so an address change can retire the old entry.
    /// Reconstructable; never persisted.
    tracked: HashMap<String, Ipv4Addr>,
}

impl Reconciler {
    pub fn new(
        cfg: RedirectConfig,
        iptables_cmd: String,
        exec: Arc<dyn Exec>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Reconciler {
            ipset: Ipset::new(exec.clone()),
            firewall: Firewall::new(exec.clone(), iptables_cmd),
            routes: Routes::new(exec.clone()),
            tunnels: Tunnels::new(exec.clone()),
            exec,
            cfg,
            metrics,
            tracked: HashMap::new(),
        }
    }

    /// Fail early when the kernel surfaces are unusable; the agent must not
    /// reach the serving state in that case.
    pub fn verify_capabilities(&self) -> Result<(), Error> {
        self.firewall.probe()?;
        self.ipset.probe()?;
        self.routes.probe()
    }

    /// Idempotent full install: chains and rule batches, the membership set,
    /// sysctls, tunnels, then the routing tables and policy rules. Tunnels
    /// are complete before any route references them.
    pub fn install(&self) -> Result<(), Error> {
        self.firewall.ensure_chains()?;
        self.ipset.create()?;
        self.firewall.append(&conntrack_rules(&self.cfg, &self.ipset.name));
        self.firewall
            .append(&classification_rules(&self.cfg, &self.ipset.name));
        self.tunnels.tune_sysctls(&self.cfg);
        self.tunnels.install(&self.cfg)?;
        self.routes.install(&self.cfg);
        Ok(())
    }

    /// Remove everything the agent owns. Every step swallows "already gone";
    /// running this twice is as good as once.
    pub fn teardown(&self) {
        info!("reconciler terminated, cleaning up");
        self.routes.teardown();
        self.tunnels.teardown(&self.cfg);
        self.firewall.teardown();
        if let Err(e) = self.ipset.destroy() {
            warn!("error destroying ipset: {e}");
        }
    }

    /// Apply one pod event. Kernel failures are logged and absorbed; the
    /// next observation of the pod retries.
    pub fn handle_event(&mut self, event: &PodEvent) {
        self.metrics.record_event(op_of(event));
        let pod = event.pod();
        if pod.node != self.cfg.node_name {
            debug!("ignoring pod {pod} on node {}", pod.node);
            return;
        }
        let desired = !matches!(event, PodEvent::Delete(_)) && pod.mesh_member;
        if let (true, Some(ip)) = (desired, pod.ip) {
            if let Some(&old) = self.tracked.get(&pod.uid) {
                if old != ip {
                    info!("pod {pod} changed address {old} -> {ip}");
                    self.remove_pod(pod, old);
                }
            }
            self.add_pod(pod, ip);
        } else if let Some(ip) = self.tracked.get(&pod.uid).copied().or(pod.ip) {
            self.remove_pod(pod, ip);
        }
        self.metrics.set_redirected_pods(self.tracked.len());
    }

    /// Reconcile the pods known at startup.
    pub fn reconcile_existing(&mut self, pods: &[PodDescriptor]) {
        for pod in pods {
            self.handle_event(&PodEvent::Add(pod.clone()));
        }
    }

    fn add_pod(&mut self, pod: &PodDescriptor, ip: Ipv4Addr) {
        if !self.ipset.contains(pod) {
            info!("adding pod {pod} to ipset");
            if let Err(e) = self.ipset.add_ip(ip, &pod.uid) {
                self.metrics.record_failure();
                error!("failed to add pod {pod} to ipset: {e}");
            }
        } else {
            debug!("pod {pod} is in ipset");
        }

        let route = pod_route(ip, self.cfg.host_ip);
        if !self.routes.route_exists(&route) {
            info!("adding route for {pod}: {}", route.join(" "));
            if let Err(e) = self.routes.add_route(&route) {
                self.metrics.record_failure();
                warn!("failed to add route for {pod}: {e}");
            }
        } else {
            debug!("route already exists for {pod}");
        }

        self.tracked.insert(pod.uid.clone(), ip);

        // The pod's veth would otherwise drop the asymmetric return path.
        match self.routes.device_for(ip) {
            Ok(dev) => {
                if let Err(e) = set_rp_filter(self.exec.as_ref(), &dev, "0") {
                    warn!("failed to set rp_filter to 0 for device {dev}: {e}");
                }
            }
            Err(_) => warn!("failed to get device for destination {ip}"),
        }
    }

    fn remove_pod(&mut self, pod: &PodDescriptor, ip: Ipv4Addr) {
        debug!("removing pod {pod} from mesh");
        if self.ipset.contains(pod) {
            info!("removing pod {pod} from ipset");
            if let Err(e) = self.ipset.delete_ip(ip) {
                self.metrics.record_failure();
                error!("failed to delete pod {pod} from ipset: {e}");
            }
        } else {
            debug!("pod {pod} is not in ipset");
        }
        let route = pod_route(ip, self.cfg.host_ip);
        if self.routes.route_exists(&route) {
            info!("removing route: {}", route.join(" "));
            if let Err(e) = self.routes.del_route(&route) {
                self.metrics.record_failure();
                warn!("failed to delete route for {pod}: {e}");
            }
        }
        self.tracked.remove(&pod.uid);
    }

    /// The single-writer loop: consume events until drain, then tear down.
    /// A closed event source stops consumption but the installed state
    /// stays until the drain fires.
    pub async fn run(mut self, mut events: mpsc::Receiver<PodEvent>, drain: drain::Watch) {
        debug!("reconciler is running");
        let _rs = loop {
            tokio::select! {
                biased; // check the drain first
                rs = drain.clone().signaled() => {
                    info!("drain requested");
                    break rs;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(&event),
                    None => {
                        info!("pod event source closed, awaiting shutdown");
                        break drain.signaled().await;
                    }
                }
            }
        };
        self.teardown();
    }
}

fn op_of(event: &PodEvent) -> EventOp {
    match event {
        PodEvent::Add(_) => EventOp::add,
        PodEvent::Update(_) => EventOp::update,
        PodEvent::Delete(_) => EventOp::delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::redirect::constants::*;
    use crate::test_helpers::kernel::FakeKernel;
    use crate::test_helpers::{pod, redirect_config};
    use prometheus_client::registry::Registry;

    struct Fixture {
        kernel: Arc<FakeKernel>,
        reconciler: Reconciler,
    }

    fn fixture(role: Role) -> Fixture {
        let kernel = Arc::new(FakeKernel::new());
        let metrics = Arc::new(Metrics::new(&mut Registry::default()));
        let reconciler = Reconciler::new(
            redirect_config(role),
            "iptables".to_string(),
            kernel.clone(),
            metrics,
        );
        Fixture { kernel, reconciler }
    }

    #[test]
    fn membership_coherence() {
        let mut f = fixture(Role::Collapsed);
        f.reconciler.install().unwrap();
        let p1 = pod("default", "a", "uid-1", "10.244.2.7");
        let p2 = pod("default", "b", "uid-2", "10.244.2.8");
        f.reconciler.handle_event(&PodEvent::Add(p1.clone()));
        f.reconciler.handle_event(&PodEvent::Add(p2.clone()));
        f.reconciler.handle_event(&PodEvent::Delete(p1));

        let members = f.kernel.ipset_members(IPSET_NAME);
        assert_eq!(members, vec!["10.244.2.8".to_string()]);
        let pod_routes: Vec<_> = f
            .kernel
            .routes(ROUTE_TABLE_INBOUND)
            .into_iter()
            .filter(|r| r.contains("/32"))
            .collect();
        assert_eq!(
            pod_routes,
            vec![format!(
                "10.244.2.8/32 via {ZTUNNEL_INBOUND_TUN_IP} dev {INBOUND_TUN} src 10.244.2.1"
            )]
        );
    }

    #[test]
    fn install_is_idempotent() {
        let mut f = fixture(Role::Collapsed);
        f.reconciler.install().unwrap();
        let p = pod("default", "a", "uid-1", "10.244.2.7");
        f.reconciler.handle_event(&PodEvent::Add(p));
        let snapshot = f.kernel.snapshot();
        f.reconciler.install().unwrap();
        f.reconciler
            .handle_event(&PodEvent::Update(pod("default", "a", "uid-1", "10.244.2.7")));
        assert_eq!(snapshot, f.kernel.snapshot());
    }

    #[test]
    fn teardown_is_idempotent_and_complete() {
        let mut f = fixture(Role::Dpu);
        f.reconciler.install().unwrap();
        f.reconciler
            .handle_event(&PodEvent::Add(pod("default", "a", "uid-1", "10.244.2.7")));
        f.reconciler.teardown();
        assert!(!f.kernel.iptables_save().contains("ztunnel-"));
        assert!(f.kernel.policy_rules().is_empty());
        assert!(f.kernel.links().is_empty());
        assert!(f.kernel.routes(ROUTE_TABLE_INBOUND).is_empty());
        assert!(f.kernel.routes(ROUTE_TABLE_OUTBOUND).is_empty());
        assert!(f.kernel.routes(ROUTE_TABLE_PROXY).is_empty());
        assert!(f.kernel.ipset_members(IPSET_NAME).is_empty());
        // second teardown finds nothing and still succeeds
        f.reconciler.teardown();
    }

    #[test]
    fn address_change_retires_the_old_entry() {
        let mut f = fixture(Role::Collapsed);
        f.reconciler.install().unwrap();
        f.reconciler
            .handle_event(&PodEvent::Add(pod("default", "a", "uid-1", "10.244.2.7")));
        f.reconciler
            .handle_event(&PodEvent::Update(pod("default", "a", "uid-1", "10.244.2.9")));
        assert_eq!(f.kernel.ipset_members(IPSET_NAME), vec!["10.244.2.9".to_string()]);
        let routes = f.kernel.routes(ROUTE_TABLE_INBOUND);
        assert!(routes.iter().any(|r| r.starts_with("10.244.2.9/32")));
        assert!(!routes.iter().any(|r| r.starts_with("10.244.2.7/32")));
    }

    #[test]
    fn pods_on_other_nodes_are_ignored() {
        let mut f = fixture(Role::Collapsed);
        f.reconciler.install().unwrap();
        let mut p = pod("default", "a", "uid-1", "10.244.9.9");
        p.node = "worker-9".to_string();
        f.reconciler.handle_event(&PodEvent::Add(p));
        assert!(f.kernel.ipset_members(IPSET_NAME).is_empty());
    }

    #[test]
    fn non_members_are_removed_when_they_leave_the_mesh() {
        let mut f = fixture(Role::Collapsed);
        f.reconciler.install().unwrap();
        let p = pod("default", "a", "uid-1", "10.244.2.7");
        f.reconciler.handle_event(&PodEvent::Add(p.clone()));
        assert_eq!(f.kernel.ipset_members(IPSET_NAME).len(), 1);
        let mut left = p;
        left.mesh_member = false;
        f.reconciler.handle_event(&PodEvent::Update(left));
        assert!(f.kernel.ipset_members(IPSET_NAME).is_empty());
    }

    #[test]
    fn kernel_failure_does_not_poison_later_events() {
        let mut f = fixture(Role::Collapsed);
        f.reconciler.install().unwrap();
        f.kernel.fail_next("ipset");
        f.reconciler
            .handle_event(&PodEvent::Add(pod("default", "a", "uid-1", "10.244.2.7")));
        // the next observation repairs the state
        f.reconciler
            .handle_event(&PodEvent::Update(pod("default", "a", "uid-1", "10.244.2.7")));
        assert_eq!(f.kernel.ipset_members(IPSET_NAME), vec!["10.244.2.7".to_string()]);
    }

    #[tokio::test]
    async fn run_tears_down_on_drain() {
        let f = fixture(Role::Collapsed);
        f.reconciler.install().unwrap();
        let (event_tx, event_rx) = mpsc::channel(16);
        let (drain_tx, drain_rx) = drain::channel();
        let kernel = f.kernel.clone();
        let handle = tokio::spawn(f.reconciler.run(event_rx, drain_rx));
        event_tx
            .send(PodEvent::Add(pod("default", "a", "uid-1", "10.244.2.7")))
            .await
            .unwrap();
        drain_tx.drain().await;
        handle.await.unwrap();
        assert!(kernel.links().is_empty());
        assert!(!kernel.iptables_save().contains("ztunnel-"));
    }
}
