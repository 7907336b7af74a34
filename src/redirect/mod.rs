pub mod constants;
pub mod exec;
pub mod ipset;
pub mod iptables;
pub mod reconciler;
pub mod routes;
pub mod tunnel;

use std::net::Ipv4Addr;

use crate::config::Role;

/// Everything the redirection engine needs to know about this node,
/// assembled once at startup from config, host-IP discovery and (in split
/// mode) the node-pair table.
#[derive(Clone, Debug)]
pub struct RedirectConfig {
    pub role: Role,
    /// Name of this node; pods scheduled elsewhere are ignored.
    pub node_name: String,
    pub host_ip: Ipv4Addr,
    /// The ztunnel pod IP: on-node in collapsed/dpu mode, on the paired DPU
    /// in cpu mode.
    pub ztunnel_ip: Ipv4Addr,
    /// The interface the proxy is reached through: the ztunnel veth in
    /// collapsed/dpu mode, the physical uplink in cpu mode.
    pub proxy_iface: String,
    pub capture_dns: bool,
    /// The paired node's IP in split mode; tunnels cross nodes through it.
    pub peer_ip: Option<Ipv4Addr>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kernel set unavailable: {0}")]
    SetUnavailable(String),
    #[error("invalid set entry {0}: {1}")]
    EntryInvalid(String, String),
    #[error("failed to spawn {cmd}: {err}")]
    Spawn { cmd: String, err: std::io::Error },
    #[error("{cmd} {args} exited with {status}: {stderr}")]
    Command {
        cmd: String,
        args: String,
        status: i32,
        stderr: String,
    },
    #[error("sysctl {key}: {err}")]
    Sysctl { key: String, err: String },
    #[error("no route found for {0}")]
    NoRoute(String),
    #[error("no node pair for {0}")]
    NoNodePair(String),
    #[error("environment not capable: {0}")]
    NotCapable(String),
}
