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

/// A packet mark together with the mask it is set and matched under.
/// Rendered as `0xVALUE/0xMASK`, the form iptables, CONNMARK and
/// `ip rule fwmark` all accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mark {
    pub value: u32,
    pub mask: u32,
}

impl Mark {
    pub const fn new(value: u32, mask: u32) -> Self {
        Mark { value, mask }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.value, self.mask)
    }
}

/// Packet bypasses the proxy. Never saved to conntrack; one-shot per packet.
pub const SKIP_MARK: Mark = Mark::new(0x539, 0xfff);
/// Mesh-member outbound flow, routed through the Outbound table.
pub const OUTBOUND_MARK: Mark = Mark::new(0x401, 0xfff);
/// Original-source flow belonging to the proxy.
pub const PROXY_MARK: Mark = Mark::new(0x4d2, 0xfff);
/// Reply direction of a proxy-originated original-source flow.
pub const PROXY_RET_MARK: Mark = Mark::new(0x4d3, 0xfff);
/// Persistent form of the skip decision; survives NAT via conntrack.
pub const CONN_SKIP_MARK: Mark = Mark::new(0x220, 0x220);

/// Conntrack bits reserved for the skip decision.
pub const CONN_SKIP_MASK: u32 = 0x220;
/// Conntrack bits reserved for the proxy original-source decision.
/// Must not overlap CONN_SKIP_MASK; the connmark carries both independently.
pub const PROXY_MASK: u32 = 0x4d2;

pub const ROUTE_TABLE_INBOUND: u32 = 100;
pub const ROUTE_TABLE_OUTBOUND: u32 = 101;
pub const ROUTE_TABLE_PROXY: u32 = 102;

pub const RULE_PRIORITY_SKIP: u32 = 100;
pub const RULE_PRIORITY_OUTBOUND: u32 = 101;
pub const RULE_PRIORITY_PROXY_RET: u32 = 102;
pub const RULE_PRIORITY_INBOUND: u32 = 103;

/// The main routing table, target of the `goto` in the priority-100 rule.
pub const TABLE_MAIN: u32 = 32766;

pub const TABLE_MANGLE: &str = "mangle";
pub const TABLE_NAT: &str = "nat";

pub const CHAIN_PREROUTING: &str = "PREROUTING";
pub const CHAIN_INPUT: &str = "INPUT";
pub const CHAIN_FORWARD: &str = "FORWARD";
pub const CHAIN_OUTPUT: &str = "OUTPUT";
pub const CHAIN_POSTROUTING: &str = "POSTROUTING";

pub const CHAIN_ZTUNNEL_PREROUTING: &str = "ztunnel-PREROUTING";
pub const CHAIN_ZTUNNEL_INPUT: &str = "ztunnel-INPUT";
pub const CHAIN_ZTUNNEL_FORWARD: &str = "ztunnel-FORWARD";
pub const CHAIN_ZTUNNEL_OUTPUT: &str = "ztunnel-OUTPUT";
pub const CHAIN_ZTUNNEL_POSTROUTING: &str = "ztunnel-POSTROUTING";

/// Geneve devices. The inbound/outbound pair terminates at the ztunnel pod;
/// the cpu/dpu pair crosses nodes in split deployments.
pub const INBOUND_TUN: &str = "istioin";
pub const OUTBOUND_TUN: &str = "istioout";
pub const CPU_TUN: &str = "istiocpu";
pub const DPU_TUN: &str = "istiodpu";

pub const INBOUND_TUN_VNI: u32 = 1000;
pub const OUTBOUND_TUN_VNI: u32 = 1001;
pub const CROSS_NODE_TUN_VNI: u32 = 1000;

pub const INBOUND_TUN_IP: &str = "192.168.126.1";
pub const ZTUNNEL_INBOUND_TUN_IP: &str = "192.168.126.2";
pub const OUTBOUND_TUN_IP: &str = "192.168.127.1";
pub const ZTUNNEL_OUTBOUND_TUN_IP: &str = "192.168.127.2";
pub const CPU_DPU_TUN_IP: &str = "192.168.128.1";
pub const DPU_CPU_TUN_IP: &str = "192.168.128.2";
pub const TUN_PREFIX: u8 = 30;

/// Geneve control port; packets to it are left unmarked so the tunnel can
/// copy the payload mark onto the decapsulated packet.
pub const GENEVE_PORT: u16 = 6081;

pub const DNS_CAPTURE_PORT: u16 = 15053;

pub const IPSET_NAME: &str = "ztunnel-pods-ips";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conntrack_masks_do_not_overlap() {
        assert_eq!(CONN_SKIP_MASK & PROXY_MASK, 0);
    }

    #[test]
    fn conntrack_masks_cover_their_marks() {
        assert_eq!(CONN_SKIP_MARK.value & CONN_SKIP_MASK, CONN_SKIP_MARK.value);
        assert_eq!(PROXY_MARK.value & PROXY_MASK, PROXY_MARK.value);
    }

    #[test]
    fn skip_mark_does_not_trip_connskip_save() {
        // The FORWARD/INPUT save rules match ConnSkipMark under its mask; a
        // packet carrying only SkipMark must not be persisted.
        assert_ne!(SKIP_MARK.value & CONN_SKIP_MASK, CONN_SKIP_MARK.value);
    }

    #[test]
    fn mark_renders_in_iptables_form() {
        assert_eq!(SKIP_MARK.to_string(), "0x539/0xfff");
        assert_eq!(CONN_SKIP_MARK.to_string(), "0x220/0x220");
    }
}
