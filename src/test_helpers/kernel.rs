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

//! An in-memory model of the kernel surfaces the agent programs. It
//! interprets the same iptables/ipset/ip vocabulary the agent emits, so
//! tests assert on observable state instead of argument strings.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::redirect::exec::Exec;
use crate::redirect::Error;

const MAIN_TABLE: u32 = 254;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub vni: u32,
    pub remote: String,
    pub addrs: Vec<String>,
    pub up: bool,
}

#[derive(Default)]
struct IpsetSet {
    entries: Vec<(Ipv4Addr, Option<String>)>,
}

#[derive(Default)]
struct State {
    ipsets: HashMap<String, IpsetSet>,
    // (table, chain) -> rules, in order
    chains: Vec<((String, String), Vec<String>)>,
    links: Vec<Link>,
    routes: Vec<(u32, String)>,
    rules: Vec<(u32, String)>,
    sysctls: HashMap<String, String>,
    conf_entries: Vec<String>,
    commands: Vec<String>,
    fail_next_run: Option<String>,
}

pub struct FakeKernel {
    state: Mutex<State>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

fn err(cmd: &str, args: &[&str], stderr: &str) -> Error {
    Error::Command {
        cmd: cmd.to_string(),
        args: args.join(" "),
        status: 1,
        stderr: stderr.to_string(),
    }
}

impl FakeKernel {
    pub fn new() -> Self {
        let mut state = State::default();
        for (table, chain) in [
            ("mangle", "PREROUTING"),
            ("mangle", "INPUT"),
            ("mangle", "FORWARD"),
            ("mangle", "OUTPUT"),
            ("mangle", "POSTROUTING"),
            ("nat", "PREROUTING"),
            ("nat", "INPUT"),
            ("nat", "OUTPUT"),
            ("nat", "POSTROUTING"),
        ] {
            state
                .chains
                .push(((table.to_string(), chain.to_string()), Vec::new()));
        }
        state.conf_entries = ["all", "default", "lo", "eth0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        FakeKernel {
            state: Mutex::new(state),
        }
    }

    /// Make the next `run` invocation of `cmd` fail with a fake error.
    pub fn fail_next(&self, cmd: &str) {
        self.state.lock().unwrap().fail_next_run = Some(cmd.to_string());
    }

    /// Simulate a kernel that silently drops ipset comments.
    pub fn drop_comments(&self, set: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(set) = state.ipsets.get_mut(set) {
            for entry in &mut set.entries {
                entry.1 = None;
            }
        }
    }

    /// Seed a main-table route, as the CNI would have for a pod veth.
    pub fn seed_main_route(&self, ip: &str, dev: &str) {
        self.state
            .lock()
            .unwrap()
            .routes
            .push((MAIN_TABLE, format!("{ip} dev {dev} scope host")));
    }

    pub fn ipset_members(&self, name: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut members: Vec<String> = state
            .ipsets
            .get(name)
            .map(|s| s.entries.iter().map(|(ip, _)| ip.to_string()).collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn links(&self) -> Vec<Link> {
        self.state.lock().unwrap().links.clone()
    }

    pub fn routes(&self, table: u32) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .routes
            .iter()
            .filter(|(t, _)| *t == table)
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    pub fn policy_rules(&self) -> Vec<(u32, String)> {
        let mut rules = self.state.lock().unwrap().rules.clone();
        rules.sort();
        rules
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().sysctls.get(key).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// An `iptables-save`-shaped dump of both tables.
    pub fn iptables_save(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        for table in ["mangle", "nat"] {
            out.push_str(&format!("*{table}\n"));
            for ((t, chain), _) in &state.chains {
                if t == table {
                    out.push_str(&format!(":{chain}\n"));
                }
            }
            for ((t, chain), rules) in &state.chains {
                if t == table {
                    for rule in rules {
                        out.push_str(&format!("-A {chain} {rule}\n"));
                    }
                }
            }
        }
        out
    }

    /// Everything observable, for whole-state idempotence comparisons.
    pub fn snapshot(&self) -> String {
        let mut out = self.iptables_save();
        for table in [100, 101, 102, MAIN_TABLE] {
            for route in self.routes(table) {
                out.push_str(&format!("route table {table} {route}\n"));
            }
        }
        for (priority, spec) in self.policy_rules() {
            out.push_str(&format!("rule {priority} {spec}\n"));
        }
        for link in self.links() {
            out.push_str(&format!(
                "link {} vni {} remote {} up {}\n",
                link.name, link.vni, link.remote, link.up
            ));
        }
        for name in {
            let state = self.state.lock().unwrap();
            let mut sets: Vec<_> = state.ipsets.keys().cloned().collect();
            sets.sort();
            sets
        } {
            out.push_str(&format!(
                "ipset {name} [{}]\n",
                self.ipset_members(&name).join(", ")
            ));
        }
        out
    }

    fn interpret(&self, cmd: &str, args: &[&str]) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state
            .commands
            .push(format!("{cmd} {}", args.join(" ")));
        match cmd {
            "iptables" | "ip6tables" => Self::iptables(&mut state, cmd, args),
            "ipset" => Self::ipset(&mut state, cmd, args),
            "ip" => Self::ip(&mut state, cmd, args),
            other => Err(err(other, args, "command not found")),
        }
    }

    fn iptables(state: &mut State, cmd: &str, args: &[&str]) -> Result<String, Error> {
        if args.first() != Some(&"-t") || args.len() < 3 {
            return Err(err(cmd, args, "missing table"));
        }
        let table = args[1];
        let op = args[2];
        let rest = &args[3..];
        match op {
            "-N" => {
                let chain = rest[0];
                if chain_index(state, table, chain).is_some() {
                    return Err(err(cmd, args, "Chain already exists."));
                }
                state
                    .chains
                    .push(((table.to_string(), chain.to_string()), Vec::new()));
                Ok(String::new())
            }
            "-A" => {
                let chain = rest[0];
                let rule = rest[1..].join(" ");
                match chain_index(state, table, chain) {
                    Some(i) => {
                        state.chains[i].1.push(rule);
                        Ok(String::new())
                    }
                    None => Err(err(cmd, args, "No chain/target/match by that name.")),
                }
            }
            "-C" => {
                let chain = rest[0];
                let rule = rest[1..].join(" ");
                match chain_index(state, table, chain) {
                    Some(i) if state.chains[i].1.contains(&rule) => Ok(String::new()),
                    Some(_) => Err(err(
                        cmd,
                        args,
                        "Bad rule (does a matching rule exist in that chain?).",
                    )),
                    None => Err(err(cmd, args, "No chain/target/match by that name.")),
                }
            }
            "-D" => {
                let chain = rest[0];
                let rule = rest[1..].join(" ");
                match chain_index(state, table, chain) {
                    Some(i) => match state.chains[i].1.iter().position(|r| *r == rule) {
                        Some(j) => {
                            state.chains[i].1.remove(j);
                            Ok(String::new())
                        }
                        None => Err(err(
                            cmd,
                            args,
                            "Bad rule (does a matching rule exist in that chain?).",
                        )),
                    },
                    None => Err(err(cmd, args, "No chain/target/match by that name.")),
                }
            }
            "-F" => {
                let chain = rest[0];
                match chain_index(state, table, chain) {
                    Some(i) => {
                        state.chains[i].1.clear();
                        Ok(String::new())
                    }
                    None => Err(err(cmd, args, "No chain/target/match by that name.")),
                }
            }
            "-X" => {
                let chain = rest[0];
                match chain_index(state, table, chain) {
                    Some(i) if state.chains[i].1.is_empty() => {
                        state.chains.remove(i);
                        Ok(String::new())
                    }
                    Some(_) => Err(err(cmd, args, "Directory not empty.")),
                    None => Err(err(cmd, args, "No chain/target/match by that name.")),
                }
            }
            "-S" => {
                let filter = rest.first();
                let mut out = String::new();
                let chains: Vec<_> = state
                    .chains
                    .iter()
                    .filter(|((t, c), _)| t == table && filter.map(|f| c == *f).unwrap_or(true))
                    .collect();
                if chains.is_empty() {
                    return Err(err(cmd, args, "No chain/target/match by that name."));
                }
                for ((_, chain), rules) in chains {
                    for rule in rules {
                        out.push_str(&format!("-A {chain} {rule}\n"));
                    }
                }
                Ok(out.trim_end().to_string())
            }
            _ => Err(err(cmd, args, "unknown operation")),
        }
    }

    fn ipset(state: &mut State, cmd: &str, args: &[&str]) -> Result<String, Error> {
        let exist_ok = args.first() == Some(&"-exist");
        let args_rest: &[&str] = if exist_ok { &args[1..] } else { args };
        match args_rest {
            ["create", name, _type, ..] => {
                if state.ipsets.contains_key(*name) {
                    if exist_ok {
                        return Ok(String::new());
                    }
                    return Err(err(cmd, args, "set with the same name already exists"));
                }
                state.ipsets.insert(name.to_string(), IpsetSet::default());
                Ok(String::new())
            }
            ["destroy", name] => match state.ipsets.remove(*name) {
                Some(_) => Ok(String::new()),
                None => Err(err(cmd, args, "The set with the given name does not exist")),
            },
            ["add", name, ip, rest @ ..] => {
                let ip: Ipv4Addr = ip
                    .parse()
                    .map_err(|_| err(cmd, args, "syntax error: cannot parse address"))?;
                let comment = match rest {
                    ["comment", uid] => Some(uid.to_string()),
                    _ => None,
                };
                let Some(set) = state.ipsets.get_mut(*name) else {
                    return Err(err(cmd, args, "The set with the given name does not exist"));
                };
                if let Some(entry) = set.entries.iter_mut().find(|(i, _)| *i == ip) {
                    if !exist_ok {
                        return Err(err(cmd, args, "Element cannot be added to the set: it's already added"));
                    }
                    entry.1 = comment;
                } else {
                    set.entries.push((ip, comment));
                }
                Ok(String::new())
            }
            ["del", name, ip] => {
                let ip: Ipv4Addr = ip
                    .parse()
                    .map_err(|_| err(cmd, args, "syntax error: cannot parse address"))?;
                let Some(set) = state.ipsets.get_mut(*name) else {
                    return Err(err(cmd, args, "The set with the given name does not exist"));
                };
                match set.entries.iter().position(|(i, _)| *i == ip) {
                    Some(i) => {
                        set.entries.remove(i);
                        Ok(String::new())
                    }
                    None if exist_ok => Ok(String::new()),
                    None => Err(err(cmd, args, "Element cannot be deleted from the set: it's not added")),
                }
            }
            ["list", "-n"] => {
                let mut names: Vec<_> = state.ipsets.keys().cloned().collect();
                names.sort();
                Ok(names.join("\n"))
            }
            ["list", name] => {
                let Some(set) = state.ipsets.get(*name) else {
                    return Err(err(cmd, args, "The set with the given name does not exist"));
                };
                let mut out = format!(
                    "Name: {name}\nType: hash:ip\nHeader: family inet hashsize 1024 maxelem 65536 comment\nMembers:\n"
                );
                for (ip, comment) in &set.entries {
                    match comment {
                        Some(c) => out.push_str(&format!("{ip} comment \"{c}\"\n")),
                        None => out.push_str(&format!("{ip}\n")),
                    }
                }
                Ok(out)
            }
            _ => Err(err(cmd, args, "unknown ipset operation")),
        }
    }

    fn ip(state: &mut State, cmd: &str, args: &[&str]) -> Result<String, Error> {
        match args {
            ["-V"] => Ok("ip utility, iproute2-6.1.0".to_string()),
            ["route", "add", rest @ ..] => {
                let (table, spec) = split_table(rest);
                if state.routes.iter().any(|(t, s)| *t == table && *s == spec) {
                    return Err(err(cmd, args, "RTNETLINK answers: File exists"));
                }
                state.routes.push((table, spec));
                Ok(String::new())
            }
            ["route", "del", rest @ ..] => {
                let (table, spec) = split_table(rest);
                match state
                    .routes
                    .iter()
                    .position(|(t, s)| *t == table && *s == spec)
                {
                    Some(i) => {
                        state.routes.remove(i);
                        Ok(String::new())
                    }
                    None => Err(err(cmd, args, "RTNETLINK answers: No such process")),
                }
            }
            ["route", "flush", "table", table] => {
                let table: u32 = table
                    .parse()
                    .map_err(|_| err(cmd, args, "invalid table"))?;
                state.routes.retain(|(t, _)| *t != table);
                Ok(String::new())
            }
            ["route", "show", rest @ ..] => {
                let (table, spec) = split_table(rest);
                let out: Vec<String> = state
                    .routes
                    .iter()
                    .filter(|(t, s)| *t == table && (spec.is_empty() || *s == spec))
                    .map(|(_, s)| s.clone())
                    .collect();
                Ok(out.join("\n"))
            }
            ["route", "get", ip] => {
                for (table, spec) in &state.routes {
                    if *table == MAIN_TABLE
                        && (spec.starts_with(&format!("{ip} ")) || spec.starts_with(&format!("{ip}/32 ")))
                    {
                        if let Some(dev) = token_after(spec, "dev") {
                            return Ok(format!("{ip} dev {dev} src 10.244.2.1 uid 0"));
                        }
                    }
                }
                Err(err(cmd, args, "RTNETLINK answers: Network is unreachable"))
            }
            ["rule", "add", "priority", priority, rest @ ..] => {
                let priority: u32 = priority
                    .parse()
                    .map_err(|_| err(cmd, args, "invalid priority"))?;
                state.rules.push((priority, rest.join(" ")));
                Ok(String::new())
            }
            ["rule", "del", "priority", priority] => {
                let priority: u32 = priority
                    .parse()
                    .map_err(|_| err(cmd, args, "invalid priority"))?;
                match state.rules.iter().position(|(p, _)| *p == priority) {
                    Some(i) => {
                        state.rules.remove(i);
                        Ok(String::new())
                    }
                    None => Err(err(cmd, args, "RTNETLINK answers: No such file or directory")),
                }
            }
            ["link", "add", name, "type", "geneve", "id", vni, "remote", remote] => {
                if state.links.iter().any(|l| l.name == *name) {
                    return Err(err(cmd, args, "RTNETLINK answers: File exists"));
                }
                state.links.push(Link {
                    name: name.to_string(),
                    vni: vni.parse().map_err(|_| err(cmd, args, "invalid vni"))?,
                    remote: remote.to_string(),
                    addrs: Vec::new(),
                    up: false,
                });
                state.conf_entries.push(name.to_string());
                Ok(String::new())
            }
            ["addr", "add", cidr, "dev", name] => {
                let Some(link) = state.links.iter_mut().find(|l| l.name == *name) else {
                    return Err(err(cmd, args, &format!("Cannot find device \"{name}\"")));
                };
                if link.addrs.iter().any(|a| a == cidr) {
                    return Err(err(cmd, args, "RTNETLINK answers: File exists"));
                }
                link.addrs.push(cidr.to_string());
                Ok(String::new())
            }
            ["link", "set", name, "up"] => {
                match state.links.iter_mut().find(|l| l.name == *name) {
                    Some(link) => {
                        link.up = true;
                        Ok(String::new())
                    }
                    None => Err(err(cmd, args, &format!("Cannot find device \"{name}\""))),
                }
            }
            ["link", "del", name] => {
                match state.links.iter().position(|l| l.name == *name) {
                    Some(i) => {
                        state.links.remove(i);
                        state.conf_entries.retain(|e| e != name);
                        Ok(String::new())
                    }
                    None => Err(err(cmd, args, &format!("Cannot find device \"{name}\""))),
                }
            }
            _ => Err(err(cmd, args, "unknown ip operation")),
        }
    }
}

fn chain_index(state: &State, table: &str, chain: &str) -> Option<usize> {
    state
        .chains
        .iter()
        .position(|((t, c), _)| t == table && c == chain)
}

fn split_table(tokens: &[&str]) -> (u32, String) {
    if tokens.first() == Some(&"table") {
        if let Some(table) = tokens.get(1).and_then(|t| t.parse().ok()) {
            return (table, tokens[2..].join(" "));
        }
    }
    (MAIN_TABLE, tokens.join(" "))
}

fn token_after(spec: &str, key: &str) -> Option<String> {
    let mut tokens = spec.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == key {
            return tokens.next().map(|t| t.to_string());
        }
    }
    None
}

impl Exec for FakeKernel {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_next_run.as_deref() == Some(cmd) {
                state.fail_next_run = None;
                return Err(err(cmd, args, "injected failure"));
            }
        }
        self.interpret(cmd, args).map(|_| ())
    }

    fn output(&self, cmd: &str, args: &[&str]) -> Result<String, Error> {
        self.interpret(cmd, args)
    }

    fn set_sysctl(&self, key: &str, value: &str) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .sysctls
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn ipv4_conf_entries(&self) -> Result<Vec<String>, Error> {
        Ok(self.state.lock().unwrap().conf_entries.clone())
    }
}
