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

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;
use tracing::warn;

use crate::config::ConfigSource;

/// What the agent observes about a pod. Owned by the external pod source;
/// the agent never mutates these.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PodDescriptor {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    /// The pod's primary IPv4 address, absent until the sandbox has one.
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    /// Name of the node the pod is scheduled on.
    pub node: String,
    /// Whether the pod is enrolled in the mesh.
    #[serde(default)]
    pub mesh_member: bool,
}

impl fmt::Display for PodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.uid)
    }
}

/// The event stream contract with the pod source. Add and Update flow
/// through the same state machine.
#[derive(Clone, Debug)]
pub enum PodEvent {
    Add(PodDescriptor),
    Update(PodDescriptor),
    Delete(PodDescriptor),
}

impl PodEvent {
    pub fn pod(&self) -> &PodDescriptor {
        match self {
            PodEvent::Add(p) | PodEvent::Update(p) | PodEvent::Delete(p) => p,
        }
    }
}

/// What the agent needs from the node object.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    /// Spec.PodCIDR when the cluster assigns one.
    #[serde(default)]
    pub pod_cidr: Option<String>,
    /// The node's InternalIP address.
    #[serde(default)]
    pub internal_ip: Option<IpAddr>,
}

/// Pick the host IP: the local interface address inside the node's pod CIDR
/// when one is set (kind puts the address we want there, not in InternalIP),
/// otherwise the InternalIP.
pub fn discover_host_ip(node: &NodeDescriptor) -> anyhow::Result<Ipv4Addr> {
    if let Some(cidr) = node.pod_cidr.as_deref().filter(|c| !c.is_empty()) {
        let net: Ipv4Net = cidr.parse()?;
        if let Some(ip) = host_ip_in(net, local_ipv4_addrs()?) {
            return Ok(ip);
        }
        warn!(cidr, "no local address inside the pod CIDR, falling back to InternalIP");
    }
    match node.internal_ip {
        Some(IpAddr::V4(ip)) => Ok(ip),
        Some(IpAddr::V6(ip)) => anyhow::bail!("node InternalIP {ip} is not IPv4"),
        None => anyhow::bail!("node {} has neither a usable pod CIDR nor an InternalIP", node.name),
    }
}

fn host_ip_in(net: Ipv4Net, addrs: impl IntoIterator<Item = Ipv4Addr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find(|ip| net.contains(ip))
}

fn local_ipv4_addrs() -> anyhow::Result<Vec<Ipv4Addr>> {
    Ok(local_interfaces()?.map(|(_, ip)| ip).collect())
}

/// The interface holding the host IP; cpu mode uses it as the uplink toward
/// the DPU when none is configured.
pub fn host_net_device(host_ip: Ipv4Addr) -> anyhow::Result<String> {
    device_holding(host_ip, local_interfaces()?)
        .ok_or_else(|| anyhow::anyhow!("no interface holds {host_ip}"))
}

fn device_holding(
    ip: Ipv4Addr,
    interfaces: impl IntoIterator<Item = (String, Ipv4Addr)>,
) -> Option<String> {
    interfaces
        .into_iter()
        .find(|(_, addr)| *addr == ip)
        .map(|(name, _)| name)
}

fn local_interfaces() -> anyhow::Result<impl Iterator<Item = (String, Ipv4Addr)>> {
    Ok(nix::ifaddrs::getifaddrs()?.filter_map(|ifaddr| {
        let ip = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in())?.ip();
        Some((ifaddr.interface_name, ip))
    }))
}

/// A YAML list of pod descriptors replayed as Add events at startup, for
/// running without a control plane.
pub async fn read_local_pods(source: &ConfigSource) -> anyhow::Result<Vec<PodDescriptor>> {
    let raw = source.read_to_string().await?;
    Ok(serde_yaml::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_ip_prefers_cidr_match() {
        let net: Ipv4Net = "10.244.2.0/24".parse().unwrap();
        let addrs = vec![
            "127.0.0.1".parse().unwrap(),
            "172.18.0.3".parse().unwrap(),
            "10.244.2.1".parse().unwrap(),
        ];
        assert_eq!(host_ip_in(net, addrs), Some("10.244.2.1".parse().unwrap()));
    }

    #[test]
    fn host_ip_falls_back_to_internal_ip() {
        let node = NodeDescriptor {
            name: "worker-1".to_string(),
            pod_cidr: None,
            internal_ip: Some("172.18.0.3".parse().unwrap()),
        };
        assert_eq!(
            discover_host_ip(&node).unwrap(),
            "172.18.0.3".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn device_holding_matches_exact_address() {
        let interfaces = vec![
            ("lo".to_string(), "127.0.0.1".parse().unwrap()),
            ("eth0".to_string(), "172.18.0.3".parse().unwrap()),
        ];
        assert_eq!(
            device_holding("172.18.0.3".parse().unwrap(), interfaces.clone()),
            Some("eth0".to_string())
        );
        assert_eq!(device_holding("172.18.0.9".parse().unwrap(), interfaces), None);
    }

    #[test]
    fn missing_everything_is_an_error() {
        let node = NodeDescriptor {
            name: "worker-1".to_string(),
            ..Default::default()
        };
        assert!(discover_host_ip(&node).is_err());
    }

    #[tokio::test]
    async fn local_pods_parse_from_yaml() {
        let yaml = r#"
- uid: uid-1
  namespace: default
  name: a
  ip: 10.244.2.7
  node: worker-1
  mesh_member: true
- uid: uid-2
  namespace: default
  name: b
  node: worker-1
"#;
        let source = ConfigSource::Static(bytes::Bytes::from_static(yaml.as_bytes()));
        let pods = read_local_pods(&source).await.unwrap();
        assert_eq!(pods.len(), 2);
        assert!(pods[0].mesh_member);
        assert_eq!(pods[1].ip, None);
    }
}
