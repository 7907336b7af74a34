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

use tracing::{debug, error};

use super::constants::IPSET_NAME;
use super::exec::Exec;
use super::Error;
use crate::pods::PodDescriptor;

/// One member of the set: the pod IP, and the pod UID when the kernel kept
/// the comment. Not all kernels persist comments, so readers key on IP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub ip: Ipv4Addr,
    pub comment: Option<String>,
}

/// The kernel hash:ip set holding the IPs of locally redirected pods.
/// The classifier's `--match-set` rules test membership in constant time.
#[derive(Clone)]
pub struct Ipset {
    pub name: String,
    exec: Arc<dyn Exec>,
}

impl Ipset {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Ipset {
            name: IPSET_NAME.to_string(),
            exec,
        }
    }

    /// Create the set. Re-running against an existing set is success.
    pub fn create(&self) -> Result<(), Error> {
        self.exec
            .run(
                "ipset",
                &["-exist", "create", &self.name, "hash:ip", "comment"],
            )
            .map_err(|e| Error::SetUnavailable(e.to_string()))
    }

    pub fn destroy(&self) -> Result<(), Error> {
        match self.exec.run("ipset", &["destroy", &self.name]) {
            Ok(()) => Ok(()),
            // Missing on delete is success.
            Err(Error::Command { ref stderr, .. }) if stderr.contains("does not exist") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn add_ip(&self, ip: Ipv4Addr, uid: &str) -> Result<(), Error> {
        let ip = ip.to_string();
        self.exec.run(
            "ipset",
            &["-exist", "add", &self.name, &ip, "comment", uid],
        )
    }

    pub fn delete_ip(&self, ip: Ipv4Addr) -> Result<(), Error> {
        let ip = ip.to_string();
        self.exec.run("ipset", &["-exist", "del", &self.name, &ip])
    }

    pub fn list(&self) -> Result<Vec<Entry>, Error> {
        let out = self.exec.output("ipset", &["list", &self.name])?;
        Ok(parse_members(&out))
    }

    /// True if the pod is already represented in the set, matching by UID
    /// comment or, when comments were dropped by the kernel, by IP.
    pub fn contains(&self, pod: &PodDescriptor) -> bool {
        let entries = match self.list() {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to list ipset entries: {e}");
                return false;
            }
        };
        entries.iter().any(|entry| {
            entry.comment.as_deref() == Some(pod.uid.as_str()) || Some(entry.ip) == pod.ip
        })
    }

    /// Fails when the ipset module or binary is unusable; the agent refuses
    /// to serve in that case.
    pub fn probe(&self) -> Result<(), Error> {
        self.exec
            .output("ipset", &["list", "-n"])
            .map(|sets| debug!(sets = %sets, "ipset probe"))
            .map_err(|e| Error::SetUnavailable(e.to_string()))
    }
}

/// Parse `ipset list <name>` output. Members follow the `Members:` header,
/// one per line, as `<ip> comment "<uid>"`.
fn parse_members(output: &str) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut in_members = false;
    for line in output.lines() {
        if !in_members {
            in_members = line.starts_with("Members:");
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(ip) = tokens.next().and_then(|t| t.parse::<Ipv4Addr>().ok()) else {
            continue;
        };
        let comment = match (tokens.next(), tokens.next()) {
            (Some("comment"), Some(quoted)) => Some(quoted.trim_matches('"').to_string()),
            _ => None,
        };
        entries.push(Entry { ip, comment });
    }
    entries
}
