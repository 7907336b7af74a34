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

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub struct Metrics {
    pod_events: Family<EventLabels, Counter>,
    reconcile_failures: Counter,
    redirected_pods: Gauge,
}

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum EventOp {
    add,
    update,
    delete,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    op: EventOp,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let pod_events: Family<EventLabels, Counter> = Default::default();
        registry.register(
            "pod_events",
            "Pod lifecycle events observed by the reconciler",
            pod_events.clone(),
        );
        let reconcile_failures = Counter::default();
        registry.register(
            "reconcile_failures",
            "Kernel mutations that failed and were deferred to the next observation",
            reconcile_failures.clone(),
        );
        let redirected_pods = Gauge::default();
        registry.register(
            "redirected_pods",
            "Pods currently steered through the node proxy",
            redirected_pods.clone(),
        );
        Self {
            pod_events,
            reconcile_failures,
            redirected_pods,
        }
    }

    pub fn record_event(&self, op: EventOp) {
        self.pod_events.get_or_create(&EventLabels { op }).inc();
    }

    pub fn record_failure(&self) {
        self.reconcile_failures.inc();
    }

    pub fn set_redirected_pods(&self, count: usize) {
        self.redirected_pods.set(count.try_into().unwrap_or(-1));
    }
}
