use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Incoming;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bucket::BucketSet;
use crate::config::Config;
use crate::proxy::forwarding::{
    bad_gateway, forward, origin_prefix, service_unavailable, HttpClient, RespBody,
};
use crate::Result;

/// Post-rejection penalty imposed on an over-budget client before the
/// 503 is delivered. Deliberately not cancellable.
const TARPIT: Duration = Duration::from_secs(60);

/// Bind the configured listen port and run the reverse proxy until
/// `shutdown` flips.
pub async fn run(
    config: Arc<Config>,
    buckets: Arc<BucketSet>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(addr).await?;
    serve(listener, config, buckets, shutdown).await
}

/// Run the reverse proxy on an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    config: Arc<Config>,
    buckets: Arc<BucketSet>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let origin = origin_prefix(&config.backend)?;
    let addr = listener.local_addr()?;

    let connector = HttpConnector::new();
    let client: HttpClient = Client::builder(TokioExecutor::new()).build(connector);
    let builder = ConnBuilder::new(TokioExecutor::new());

    info!(?addr, backend = %origin, "starting proxy");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("proxy stopped");
                return Ok(());
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                };

                let builder = builder.clone();
                let client = client.clone();
                let origin = origin.clone();
                let buckets = buckets.clone();
                tokio::spawn(async move {
                    let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let client = client.clone();
                        let origin = origin.clone();
                        let buckets = buckets.clone();
                        async move { admit(req, client, origin, buckets, peer).await }
                    });

                    if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                        debug!(?peer, error = %e, "serve_connection error");
                    }
                });
            }
        }
    }
}

/// Forward, measure, charge, then delay or reject.
///
/// The origin's response is held back while any imposed wait elapses;
/// an outright rejection tarpits the connection for [`TARPIT`] before
/// the 503 goes out. Cost is charged even when the origin failed,
/// since the time was spent either way.
async fn admit(
    req: Request<Incoming>,
    client: HttpClient,
    origin: String,
    buckets: Arc<BucketSet>,
    peer: SocketAddr,
) -> std::result::Result<hyper::Response<RespBody>, hyper::Error> {
    let start = Instant::now();
    let headers = req.headers().clone();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let outcome = forward(req, &client, &origin).await;

    let cost = start.elapsed().as_secs_f64();
    let verdict = buckets.charge(peer, &headers, start, cost);

    if verdict.rejected {
        warn!(%peer, %method, %path, cost, "over budget, tarpitting");
        tokio::time::sleep(TARPIT).await;
        return Ok(service_unavailable());
    }

    if verdict.max_delay > Duration::ZERO {
        let elapsed = start.elapsed();
        if verdict.max_delay > elapsed {
            let wait = verdict.max_delay - elapsed;
            debug!(%peer, %method, %path, wait_ms = wait.as_millis() as u64, "delaying response");
            tokio::time::sleep(wait).await;
        }
    }

    match outcome {
        Ok(resp) => Ok(resp),
        Err(e) => {
            warn!(%peer, %method, %path, error = %e, "origin request failed");
            Ok(bad_gateway())
        }
    }
}
