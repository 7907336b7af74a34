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

use std::process::Command;

use sysctl::Sysctl;
use tracing::trace;

use super::Error;

/// The seam between the agent and the kernel. Every mutation the agent makes
/// (iptables, ipset, ip, sysctl) goes through one of these methods; tests
/// substitute an in-memory kernel model.
pub trait Exec: Send + Sync {
    /// Run a command, discarding stdout. Non-zero exit is an error carrying
    /// captured stderr.
    fn run(&self, cmd: &str, args: &[&str]) -> Result<(), Error>;

    /// Run a command and return trimmed stdout.
    fn output(&self, cmd: &str, args: &[&str]) -> Result<String, Error>;

    /// Write a `net.ipv4.conf.*` style sysctl.
    fn set_sysctl(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Names of the per-interface directories under /proc/sys/net/ipv4/conf.
    fn ipv4_conf_entries(&self) -> Result<Vec<String>, Error>;
}

/// Production implementation: forks the real binaries and writes real sysctls.
#[derive(Default)]
pub struct OsExec {}

impl OsExec {
    fn invoke(&self, cmd: &str, args: &[&str]) -> Result<std::process::Output, Error> {
        trace!(cmd, args = %args.join(" "), "exec");
        Command::new(cmd)
            .args(args)
            .output()
            .map_err(|err| Error::Spawn {
                cmd: cmd.to_string(),
                err,
            })
    }
}

impl Exec for OsExec {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<(), Error> {
        let out = self.invoke(cmd, args)?;
        if out.status.success() {
            return Ok(());
        }
        Err(Error::Command {
            cmd: cmd.to_string(),
            args: args.join(" "),
            status: out.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }

    fn output(&self, cmd: &str, args: &[&str]) -> Result<String, Error> {
        let out = self.invoke(cmd, args)?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).trim().to_string());
        }
        Err(Error::Command {
            cmd: cmd.to_string(),
            args: args.join(" "),
            status: out.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }

    fn set_sysctl(&self, key: &str, value: &str) -> Result<(), Error> {
        let ctl = sysctl::Ctl::new(key).map_err(|e| Error::Sysctl {
            key: key.to_string(),
            err: e.to_string(),
        })?;
        ctl.set_value_string(value)
            .map(|_| ())
            .map_err(|e| Error::Sysctl {
                key: key.to_string(),
                err: e.to_string(),
            })
    }

    fn ipv4_conf_entries(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        let entries =
            std::fs::read_dir("/proc/sys/net/ipv4/conf").map_err(|err| Error::Spawn {
                cmd: "/proc/sys/net/ipv4/conf".to_string(),
                err,
            })?;
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }
}

/// rp_filter is disabled wherever mesh traffic may arrive on an interface the
/// kernel would not route the reverse path through.
pub fn set_rp_filter(exec: &dyn Exec, dev: &str, value: &str) -> Result<(), Error> {
    exec.set_sysctl(&format!("net.ipv4.conf.{dev}.rp_filter"), value)
}

pub fn set_accept_local(exec: &dyn Exec, dev: &str, value: &str) -> Result<(), Error> {
    exec.set_sysctl(&format!("net.ipv4.conf.{dev}.accept_local"), value)
}
