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

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

const NODE_NAME: &str = "NODE_NAME";
const ROLE: &str = "ROLE";
const CAPTURE_DNS: &str = "CAPTURE_DNS";
const ZTUNNEL_IP: &str = "ZTUNNEL_IP";
const ZTUNNEL_VETH: &str = "ZTUNNEL_VETH";
const CPU_ETH: &str = "CPU_ETH";
const OFFMESH_CONFIG: &str = "OFFMESH_CONFIG";
const LOCAL_POD_CONFIG: &str = "LOCAL_POD_CONFIG";
const NODE_POD_CIDR: &str = "NODE_POD_CIDR";
const NODE_INTERNAL_IP: &str = "NODE_INTERNAL_IP";
const HOST_IP: &str = "HOST_IP";
const READINESS_ADDR: &str = "READINESS_ADDR";
const STATS_ADDR: &str = "STATS_ADDR";
const IPTABLES_CMD: &str = "IPTABLES_CMD";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";

const DEFAULT_READINESS_PORT: u16 = 15021;
const DEFAULT_STATS_PORT: u16 = 15020;
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Which redirection variant this node runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum Role {
    /// Proxy on the same node, reached over its veth.
    Collapsed,
    /// Compute side of a split deployment; the proxy lives on the paired DPU.
    Cpu,
    /// Smart-NIC side of a split deployment, hosting the proxy.
    Dpu,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "collapsed" => Ok(Role::Collapsed),
            "cpu" => Ok(Role::Cpu),
            "dpu" => Ok(Role::Dpu),
            other => Err(format!("unknown role {other}")),
        }
    }
}

#[derive(serde::Serialize, Clone, Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Static(Bytes),
}

impl ConfigSource {
    pub async fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path).await?,
            ConfigSource::Static(data) => std::str::from_utf8(data).map(|s| s.to_string())?,
        })
    }
}

#[derive(serde::Serialize, Clone, Debug)]
pub struct Config {
    /// The name of the node this agent is running on.
    pub node_name: String,
    pub role: Role,
    /// If true, member-sourced UDP/53 is DNAT'd to the proxy's DNS capture
    /// port.
    pub capture_dns: bool,

    /// The ztunnel pod IP. Required in every role; in cpu mode it is the
    /// ztunnel on the paired DPU.
    pub ztunnel_ip: Option<Ipv4Addr>,
    /// The host side of the ztunnel pod's veth (collapsed/dpu).
    pub ztunnel_veth: Option<String>,
    /// The physical uplink toward the DPU (cpu).
    pub cpu_eth: Option<String>,

    /// Node-pair table for split deployments.
    #[serde(skip_serializing)]
    pub offmesh_config: Option<ConfigSource>,
    /// Pod descriptors replayed as Add events at startup, for running
    /// without a control plane.
    #[serde(skip_serializing)]
    pub local_pod_config: Option<ConfigSource>,

    /// Spec.PodCIDR of the node object, when set.
    pub pod_cidr: Option<String>,
    /// The node's InternalIP.
    pub internal_ip: Option<IpAddr>,
    /// Overrides host-IP discovery entirely.
    pub host_ip: Option<Ipv4Addr>,

    pub readiness_addr: SocketAddr,
    pub stats_addr: SocketAddr,

    /// The iptables binary to execute.
    pub iptables_cmd: String,
    pub termination_grace_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_name: String::new(),
            role: Role::Collapsed,
            capture_dns: false,
            ztunnel_ip: None,
            ztunnel_veth: None,
            cpu_eth: None,
            offmesh_config: None,
            local_pod_config: None,
            pod_cidr: None,
            internal_ip: None,
            host_ip: None,
            readiness_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_READINESS_PORT),
            stats_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_STATS_PORT),
            iptables_cmd: "iptables".to_string(),
            termination_grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl Config {
    /// The interface the proxy is reached through for this role.
    pub fn proxy_iface(&self) -> Result<String, Error> {
        match self.role {
            Role::Collapsed | Role::Dpu => self
                .ztunnel_veth
                .clone()
                .ok_or(Error::Missing(ZTUNNEL_VETH)),
            Role::Cpu => self.cpu_eth.clone().ok_or(Error::Missing(CPU_ETH)),
        }
    }

    pub fn require_ztunnel_ip(&self) -> Result<Ipv4Addr, Error> {
        self.ztunnel_ip.ok_or(Error::Missing(ZTUNNEL_IP))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("required setting {0} is not set")]
    Missing(&'static str),
    #[error("error occurred: {0}")]
    Other(anyhow::Error),
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

fn config_file(env: &str) -> Option<ConfigSource> {
    std::env::var(env)
        .ok()
        .filter(|p| !p.is_empty())
        .map(|p| ConfigSource::File(PathBuf::from(p)))
}

pub fn parse_config() -> Result<Config, Error> {
    let defaults = Config::default();
    Ok(Config {
        node_name: parse(NODE_NAME)?.ok_or(Error::Missing(NODE_NAME))?,
        role: parse_default(ROLE, Role::Collapsed)?,
        capture_dns: parse_default(CAPTURE_DNS, false)?,
        ztunnel_ip: parse(ZTUNNEL_IP)?,
        ztunnel_veth: parse(ZTUNNEL_VETH)?,
        cpu_eth: parse(CPU_ETH)?,
        offmesh_config: config_file(OFFMESH_CONFIG),
        local_pod_config: config_file(LOCAL_POD_CONFIG),
        pod_cidr: parse(NODE_POD_CIDR)?,
        internal_ip: parse(NODE_INTERNAL_IP)?,
        host_ip: parse(HOST_IP)?,
        readiness_addr: parse_default(READINESS_ADDR, defaults.readiness_addr)?,
        stats_addr: parse_default(STATS_ADDR, defaults.stats_addr)?,
        iptables_cmd: parse_default(IPTABLES_CMD, defaults.iptables_cmd)?,
        termination_grace_period: parse::<u64>(TERMINATION_GRACE_PERIOD)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.termination_grace_period),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("collapsed".parse::<Role>().unwrap(), Role::Collapsed);
        assert_eq!("CPU".parse::<Role>().unwrap(), Role::Cpu);
        assert_eq!("Dpu".parse::<Role>().unwrap(), Role::Dpu);
        assert!("sidecar".parse::<Role>().is_err());
    }

    #[test]
    fn proxy_iface_is_role_dependent() {
        let mut cfg = Config {
            ztunnel_veth: Some("vethztunnel".to_string()),
            cpu_eth: Some("eth0".to_string()),
            ..Default::default()
        };
        cfg.role = Role::Collapsed;
        assert_eq!(cfg.proxy_iface().unwrap(), "vethztunnel");
        cfg.role = Role::Cpu;
        assert_eq!(cfg.proxy_iface().unwrap(), "eth0");
        cfg.cpu_eth = None;
        assert!(matches!(cfg.proxy_iface(), Err(Error::Missing(_))));
    }
}
