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

//! End-to-end redirection scenarios against the in-memory kernel model.

use std::sync::Arc;

use prometheus_client::registry::Registry;

use ambient_agent::config::Role;
use ambient_agent::metrics::redirect::Metrics;
use ambient_agent::pods::PodEvent;
use ambient_agent::redirect::constants::*;
use ambient_agent::redirect::exec::Exec;
use ambient_agent::redirect::reconciler::Reconciler;
use ambient_agent::test_helpers::kernel::FakeKernel;
use ambient_agent::test_helpers::{pod, redirect_config, TEST_HOST_IP};

fn agent(role: Role, capture_dns: bool) -> (Arc<FakeKernel>, Reconciler) {
    let kernel = Arc::new(FakeKernel::new());
    let mut cfg = redirect_config(role);
    cfg.capture_dns = capture_dns;
    let metrics = Arc::new(Metrics::new(&mut Registry::default()));
    let reconciler = Reconciler::new(cfg, "iptables".to_string(), kernel.clone(), metrics);
    (kernel, reconciler)
}

#[test]
fn collapsed_pod_join() {
    let (kernel, mut reconciler) = agent(Role::Collapsed, false);
    reconciler.verify_capabilities().unwrap();
    reconciler.install().unwrap();

    reconciler.handle_event(&PodEvent::Add(pod("default", "a", "U1", "10.244.2.7")));

    assert_eq!(kernel.ipset_members(IPSET_NAME), vec!["10.244.2.7".to_string()]);
    assert!(kernel.routes(ROUTE_TABLE_INBOUND).contains(&format!(
        "10.244.2.7/32 via {ZTUNNEL_INBOUND_TUN_IP} dev {INBOUND_TUN} src {TEST_HOST_IP}"
    )));
}

#[test]
fn collapsed_pod_delete() {
    let (kernel, mut reconciler) = agent(Role::Collapsed, false);
    reconciler.install().unwrap();

    let p = pod("default", "a", "U1", "10.244.2.7");
    reconciler.handle_event(&PodEvent::Add(p.clone()));
    reconciler.handle_event(&PodEvent::Delete(p));

    assert!(kernel.ipset_members(IPSET_NAME).is_empty());
    assert!(!kernel
        .routes(ROUTE_TABLE_INBOUND)
        .iter()
        .any(|r| r.contains("10.244.2.7/32")));
}

#[test]
fn repeat_install_is_observably_identical() {
    let (kernel, reconciler) = agent(Role::Collapsed, true);
    reconciler.install().unwrap();
    let first = kernel.snapshot();
    reconciler.install().unwrap();
    assert_eq!(first, kernel.snapshot());
}

#[test]
fn dns_capture_rule_present_only_when_enabled() {
    let expected = format!(
        "-p udp -m set --match-set {IPSET_NAME} src --dport 53 -j DNAT --to 10.244.2.3:{DNS_CAPTURE_PORT}"
    );

    let (kernel, reconciler) = agent(Role::Collapsed, true);
    reconciler.install().unwrap();
    assert!(kernel.iptables_save().contains(&expected));

    let (kernel, reconciler) = agent(Role::Collapsed, false);
    reconciler.install().unwrap();
    assert!(!kernel.iptables_save().contains("DNAT"));
}

#[test]
fn split_mode_cpu_node() {
    let (kernel, reconciler) = agent(Role::Cpu, false);
    reconciler.install().unwrap();

    // outbound default crosses to the paired DPU node
    assert_eq!(
        kernel.routes(ROUTE_TABLE_OUTBOUND),
        vec![format!("0.0.0.0/0 via {DPU_CPU_TUN_IP} dev {DPU_TUN}")]
    );
    // only the cross-node tunnel exists here
    let names: Vec<_> = kernel.links().into_iter().map(|l| l.name).collect();
    assert_eq!(names, vec![DPU_TUN.to_string()]);
    // and only three policy rules; the unconditional inbound lookup is the
    // DPU side's business
    assert_eq!(
        kernel
            .policy_rules()
            .into_iter()
            .map(|(p, _)| p)
            .collect::<Vec<_>>(),
        vec![100, 101, 102]
    );
}

#[test]
fn teardown_leaves_nothing_behind() {
    let (kernel, mut reconciler) = agent(Role::Dpu, true);
    reconciler.install().unwrap();
    reconciler.handle_event(&PodEvent::Add(pod("default", "a", "U1", "10.244.2.7")));

    reconciler.teardown();

    let dump = kernel.iptables_save();
    assert!(!dump.contains("ztunnel-"));
    for table in [ROUTE_TABLE_INBOUND, ROUTE_TABLE_OUTBOUND, ROUTE_TABLE_PROXY] {
        assert!(kernel.routes(table).is_empty(), "table {table} not empty");
    }
    assert!(kernel.policy_rules().is_empty());
    assert!(kernel.links().is_empty());
    assert!(kernel.ipset_members(IPSET_NAME).is_empty());
}

#[test]
fn skip_return_precedes_outbound_stamp_in_the_installed_chain() {
    for role in [Role::Collapsed, Role::Cpu, Role::Dpu] {
        let (kernel, reconciler) = agent(role, false);
        reconciler.install().unwrap();
        let dump = kernel.iptables_save();
        let prerouting: Vec<&str> = dump
            .lines()
            .filter(|l| l.starts_with(&format!("-A {CHAIN_ZTUNNEL_PREROUTING}")))
            .collect();
        let skip_return = prerouting
            .iter()
            .position(|l| l.contains(&format!("--mark {SKIP_MARK} -j RETURN")))
            .expect("skip return rule installed");
        let outbound_stamp = prerouting
            .iter()
            .position(|l| l.contains(&format!("--set-mark {OUTBOUND_MARK}")))
            .expect("outbound stamp installed");
        assert!(skip_return < outbound_stamp, "role {role:?}");
    }
}

#[test]
fn host_sourced_packets_bypass_the_proxy_path() {
    for role in [Role::Collapsed, Role::Cpu, Role::Dpu] {
        let (kernel, reconciler) = agent(role, false);
        reconciler.install().unwrap();
        let expected = format!(
            "-A {CHAIN_ZTUNNEL_OUTPUT} --source {TEST_HOST_IP} -j MARK --set-mark {CONN_SKIP_MASK:#x}"
        );
        assert!(
            kernel.iptables_save().lines().any(|l| l == expected),
            "role {role:?}"
        );
    }
}

#[test]
fn tunnels_exist_before_routes_reference_them() {
    let (kernel, reconciler) = agent(Role::Collapsed, false);
    reconciler.install().unwrap();
    let commands = kernel.commands();
    let tunnel = commands
        .iter()
        .position(|c| c.starts_with(&format!("ip link add {OUTBOUND_TUN}")))
        .expect("tunnel created");
    let route = commands
        .iter()
        .position(|c| c.contains(&format!("route add table {ROUTE_TABLE_OUTBOUND}")))
        .expect("outbound route added");
    assert!(tunnel < route);
}

#[test]
fn foreign_state_survives_install_and_teardown() {
    let kernel = Arc::new(FakeKernel::new());
    // state the agent does not own
    kernel
        .run("iptables", &["-t", "nat", "-A", "POSTROUTING", "-j", "MASQUERADE"])
        .unwrap();
    kernel
        .run("ip", &["rule", "add", "priority", "50", "lookup", "250"])
        .unwrap();
    kernel
        .run(
            "ip",
            &["link", "add", "flannel.1", "type", "geneve", "id", "7", "remote", "10.0.0.9"],
        )
        .unwrap();

    let metrics = Arc::new(Metrics::new(&mut Registry::default()));
    let reconciler = Reconciler::new(
        redirect_config(Role::Collapsed),
        "iptables".to_string(),
        kernel.clone(),
        metrics,
    );
    reconciler.install().unwrap();
    reconciler.teardown();

    assert!(kernel.iptables_save().contains("MASQUERADE"));
    assert!(kernel.policy_rules().contains(&(50, "lookup 250".to_string())));
    assert!(kernel.links().iter().any(|l| l.name == "flannel.1"));
}
