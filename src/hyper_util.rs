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

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryFutureExt;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub fn empty_response(code: hyper::StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .body(Full::default())
        .expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: hyper::StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .expect("builder with known status code should not fail")
}

/// A generic HTTP/1.1 plaintext server with draining. Serves the agent's
/// localhost surfaces (readiness, stats).
pub struct Server<S> {
    name: String,
    bind: TcpListener,
    drain_rx: drain::Watch,
    state: S,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        drain_rx: drain::Watch,
        state: S,
    ) -> anyhow::Result<Self> {
        Ok(Server {
            name: name.to_string(),
            bind: TcpListener::bind(&addr).await?,
            drain_rx,
            state,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.bind.local_addr().expect("local address must be ready")
    }

    pub fn spawn<F, R>(self, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Request<hyper::body::Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<Full<Bytes>>, anyhow::Error>> + Send + 'static,
    {
        let address = self.address();
        let drain = self.drain_rx;
        let state = Arc::new(self.state);
        let f = Arc::new(f);
        info!(
            %address,
            component=self.name,
            "HTTP listener established",
        );
        let name = self.name;
        let bind = self.bind;
        tokio::spawn(async move {
            let accept_drain = drain.clone();
            loop {
                let socket = tokio::select! {
                    _ = accept_drain.clone().signaled() => break,
                    conn = bind.accept() => match conn {
                        Ok((socket, _)) => socket,
                        Err(e) => {
                            warn!(component=%name, "accept error: {e}");
                            continue;
                        }
                    },
                };
                let _ = socket.set_nodelay(true);
                let drain = drain.clone();
                let f = f.clone();
                let state = state.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    let mut serve = std::pin::pin!(http1::Builder::new()
                        .timer(TokioTimer::new())
                        .half_close(true)
                        .header_read_timeout(Duration::from_secs(2))
                        .max_buf_size(8 * 1024)
                        .serve_connection(
                            TokioIo::new(socket),
                            hyper::service::service_fn(move |req| {
                                let state = state.clone();
                                // Failures would abort the whole connection;
                                // we just want to return an HTTP error.
                                f(state, req).or_else(|err| async move {
                                    Ok::<Response<Full<Bytes>>, Infallible>(
                                        Response::builder()
                                            .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
                                            .body(err.to_string().into())
                                            .expect(
                                                "builder with known status code should not fail",
                                            ),
                                    )
                                })
                            }),
                        ));
                    let res = tokio::select! {
                        res = serve.as_mut() => res,
                        _ = drain.signaled() => {
                            debug!("server drain starting...");
                            serve.as_mut().graceful_shutdown();
                            let res = serve.await;
                            debug!("server drain done");
                            res
                        }
                    };
                    if let Err(err) = res {
                        warn!(
                            error=%err,
                            component=%name,
                            "server error",
                        );
                    }
                });
            }
        });
    }
}
