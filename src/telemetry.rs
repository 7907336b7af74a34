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

use std::env;
use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::{filter, prelude::*, Layer, Registry};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn setup_logging() -> tracing_appender::non_blocking::WorkerGuard {
    Lazy::force(&APPLICATION_START_TIME);
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .buffered_lines_limit(128_000)
        .finish(std::io::stdout());
    tracing_subscriber::registry()
        .with(fmt_layer(non_blocking))
        .init();
    guard
}

fn fmt_layer(writer: NonBlocking) -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    let filter = default_filter();
    if env::var("LOG_FORMAT").unwrap_or("plain".to_string()) == "json" {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .json()
                .flatten_event(true)
                .with_filter(filter),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_filter(filter),
        )
    }
}

fn default_filter() -> filter::Targets {
    let var: String = env::var("RUST_LOG").unwrap_or("info".to_string());
    filter::Targets::from_str(&var).expect("static filter should build")
}
