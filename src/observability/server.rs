use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Result, anyhow};
use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::MetricsCollector;
use crate::store::RunStore;

/// Serves metrics and persisted run records on a dedicated thread.
pub struct MetricsServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

struct ServerState {
    collector: MetricsCollector,
    store: Arc<dyn RunStore>,
}

impl MetricsServer {
    pub fn start(
        listen: SocketAddr,
        collector: MetricsCollector,
        store: Arc<dyn RunStore>,
    ) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();
        let state = Arc::new(ServerState { collector, store });

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    addr_tx.send(Err(err.to_string())).ok();
                    return;
                }
            };

            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let state = state.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let state = state.clone();
                            async move { handle_request(req, state).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        addr_tx.send(Err(err.to_string())).ok();
                        return;
                    }
                };
                addr_tx.send(Ok(builder.local_addr())).ok();
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    tracing::error!(error = %err, "Metrics server error");
                }
            });
        });

        let address = match addr_rx.recv() {
            Ok(Ok(address)) => address,
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(anyhow!("Failed to start metrics server on {listen}: {reason}"));
            }
            Err(_) => listen,
        };

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    let response = match (req.method(), path.as_str()) {
        (&Method::GET, "/metrics") => {
            let snapshot = state.collector.snapshot();
            text(StatusCode::OK, snapshot.to_prometheus())
        }
        (&Method::GET, "/metrics.json") => json(&state.collector.snapshot()),
        (&Method::GET, "/runs") => match state.store.list() {
            Ok(runs) => json(&runs),
            Err(err) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
        },
        (&Method::GET, other) if other.starts_with("/runs/") => {
            match Uuid::parse_str(&other["/runs/".len()..]) {
                Ok(run_id) => match state.store.load(run_id) {
                    Ok(Some(run)) => json(&run),
                    Ok(None) => not_found(),
                    Err(err) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
                },
                Err(_) => text(StatusCode::BAD_REQUEST, "Invalid run id".to_string()),
            }
        }
        _ => not_found(),
    };
    Ok(response)
}

fn json<T: serde::Serialize>(value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

fn not_found() -> Response<Body> {
    let mut response = Response::new(Body::from(Bytes::from_static(b"Not Found")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
