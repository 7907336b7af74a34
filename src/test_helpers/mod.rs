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

use crate::config::Role;
use crate::pods::PodDescriptor;
use crate::redirect::RedirectConfig;

pub mod kernel;

pub const TEST_NODE: &str = "worker-1";
pub const TEST_HOST_IP: &str = "10.244.2.1";
pub const TEST_ZTUNNEL_IP: &str = "10.244.2.3";
pub const TEST_ZTUNNEL_VETH: &str = "vethztunnel";
pub const TEST_CPU_ETH: &str = "eth0";

/// A mesh-member pod scheduled on the test node.
pub fn pod(namespace: &str, name: &str, uid: &str, ip: &str) -> PodDescriptor {
    PodDescriptor {
        uid: uid.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        ip: Some(ip.parse().expect("test pod IP must parse")),
        node: TEST_NODE.to_string(),
        mesh_member: true,
    }
}

/// A resolved redirection config for the given role, against the test node.
pub fn redirect_config(role: Role) -> RedirectConfig {
    let (proxy_iface, peer_ip) = match role {
        Role::Collapsed => (TEST_ZTUNNEL_VETH, None),
        Role::Dpu => (TEST_ZTUNNEL_VETH, Some("172.18.0.3".parse().unwrap())),
        Role::Cpu => (TEST_CPU_ETH, Some("172.18.0.4".parse().unwrap())),
    };
    RedirectConfig {
        role,
        node_name: TEST_NODE.to_string(),
        host_ip: TEST_HOST_IP.parse().unwrap(),
        ztunnel_ip: TEST_ZTUNNEL_IP.parse().unwrap(),
        proxy_iface: proxy_iface.to_string(),
        capture_dns: false,
        peer_ip,
    }
}
