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

use crate::config::{ConfigSource, Role};

/// One side of a CPU/DPU pair.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub ip: Ipv4Addr,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct NodePair {
    pub cpu: NodeInfo,
    pub dpu: NodeInfo,
}

/// The cluster's CPU/DPU pairing table. Split-mode nodes look up their peer
/// here to build the cross-node tunnel.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct OffmeshCluster {
    #[serde(default)]
    pub pairs: Vec<NodePair>,
}

impl OffmeshCluster {
    pub async fn from_source(source: &ConfigSource) -> anyhow::Result<Self> {
        let raw = source.read_to_string().await?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// The peer of `node_name` given the caller's role: a CPU node gets its
    /// DPU and vice versa. Collapsed nodes have no peer.
    pub fn pair_of(&self, node_name: &str, role: Role) -> Option<&NodeInfo> {
        match role {
            Role::Cpu => self
                .pairs
                .iter()
                .find(|p| p.cpu.name == node_name)
                .map(|p| &p.dpu),
            Role::Dpu => self
                .pairs
                .iter()
                .find(|p| p.dpu.name == node_name)
                .map(|p| &p.cpu),
            Role::Collapsed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn cluster() -> OffmeshCluster {
        OffmeshCluster {
            pairs: vec![NodePair {
                cpu: NodeInfo {
                    name: "worker-1".to_string(),
                    ip: "172.18.0.3".parse().unwrap(),
                },
                dpu: NodeInfo {
                    name: "worker-1-dpu".to_string(),
                    ip: "172.18.0.4".parse().unwrap(),
                },
            }],
        }
    }

    #[test]
    fn pair_lookup_is_symmetric() {
        let c = cluster();
        assert_eq!(c.pair_of("worker-1", Role::Cpu).unwrap().name, "worker-1-dpu");
        assert_eq!(c.pair_of("worker-1-dpu", Role::Dpu).unwrap().name, "worker-1");
        assert!(c.pair_of("worker-1", Role::Collapsed).is_none());
        assert!(c.pair_of("worker-2", Role::Cpu).is_none());
    }

    #[tokio::test]
    async fn parses_yaml() {
        let yaml = r#"
pairs:
  - cpu: { name: worker-1, ip: 172.18.0.3 }
    dpu: { name: worker-1-dpu, ip: 172.18.0.4 }
"#;
        let source = ConfigSource::Static(Bytes::from_static(yaml.as_bytes()));
        let c = OffmeshCluster::from_source(&source).await.unwrap();
        assert_eq!(c.pairs.len(), 1);
        assert_eq!(
            c.pair_of("worker-1", Role::Cpu).unwrap().ip,
            "172.18.0.4".parse::<Ipv4Addr>().unwrap()
        );
    }
}
