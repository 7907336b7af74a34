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

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use itertools::Itertools;
use tracing::info;

use crate::hyper_util::{empty_response, plaintext_response, Server};
use crate::{config, telemetry};

/// Ready tracks whether the process is ready.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
    pub fn new() -> Ready {
        Ready(Default::default())
    }

    /// register_task allows a caller to add a dependency to be marked "ready".
    pub fn register_task(&self, name: &str) -> BlockReady {
        self.0.lock().unwrap().insert(name.to_string());
        BlockReady {
            parent: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn pending(&self) -> HashSet<String> {
        self.0.lock().unwrap().clone()
    }
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
    parent: Ready,
    name: String,
}

impl BlockReady {
    pub fn subtask(&self, name: &str) -> BlockReady {
        self.parent.register_task(name)
    }
}

impl Drop for BlockReady {
    fn drop(&mut self) {
        let mut pending = self.parent.0.lock().unwrap();
        let removed = pending.remove(&self.name);
        debug_assert!(removed); // It is a bug to somehow remove something twice
        let left = pending.len();
        let dur = telemetry::APPLICATION_START_TIME.elapsed();
        if left == 0 {
            info!(
                "Task '{}' complete ({dur:?}), marking server ready",
                self.name
            );
        } else {
            info!(
                "Task '{}' complete ({dur:?}), still awaiting {left} tasks",
                self.name
            );
        }
    }
}

pub struct Service {
    s: Server<Ready>,
}

impl Service {
    pub async fn new(
        config: &config::Config,
        ready: Ready,
        drain_rx: drain::Watch,
    ) -> anyhow::Result<Self> {
        Server::<Ready>::bind("readiness", config.readiness_addr, drain_rx, ready)
            .await
            .map(|s| Service { s })
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s.spawn(|ready, req| async move {
            match req.uri().path() {
                "/healthz/ready" => Ok(handle_ready(&ready, req)),
                _ => Ok(empty_response(hyper::StatusCode::NOT_FOUND)),
            }
        })
    }
}

fn handle_ready<B>(ready: &Ready, req: Request<B>) -> Response<Full<Bytes>> {
    match *req.method() {
        hyper::Method::GET => {
            let pending = ready.pending();
            if pending.is_empty() {
                return plaintext_response(hyper::StatusCode::OK, "ready\n".into());
            }
            plaintext_response(
                hyper::StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "not ready, pending: {}\n",
                    pending.into_iter().sorted().join(", ")
                ),
            )
        }
        _ => empty_response(hyper::StatusCode::METHOD_NOT_ALLOWED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_when_all_blocks_dropped() {
        let ready = Ready::new();
        assert!(ready.pending().is_empty());
        let b1 = ready.register_task("install");
        let b2 = b1.subtask("initial reconcile");
        assert_eq!(ready.pending().len(), 2);
        drop(b1);
        assert_eq!(ready.pending().len(), 1);
        drop(b2);
        assert!(ready.pending().is_empty());
    }
}
