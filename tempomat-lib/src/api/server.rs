use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{read_frame, write_frame, DumpRequest, DUMP_METHOD};
use crate::bucket::BucketSet;
use crate::Result;

/// Serve the introspection RPC on an already-bound listener until
/// `shutdown` flips.
///
/// Every connection may issue any number of requests; an unknown
/// bucket name or method answers with an empty list rather than an
/// error, so operator tools never have to special-case a typo.
pub async fn serve(
    listener: TcpListener,
    buckets: Arc<BucketSet>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(?addr, "introspection endpoint listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("introspection endpoint stopped");
                return Ok(());
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "introspection accept error");
                        continue;
                    }
                };
                let buckets = buckets.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, buckets).await {
                        debug!(?peer, error = %e, "introspection connection ended");
                    }
                });
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, buckets: Arc<BucketSet>) -> std::io::Result<()> {
    while let Some(payload) = read_frame(&mut stream).await? {
        let entries = match serde_json::from_slice::<DumpRequest>(&payload) {
            Ok(req) if req.method == DUMP_METHOD => match buckets.get(&req.bucket_name) {
                Some(bucket) => bucket.snapshot(),
                None => {
                    debug!(bucket = %req.bucket_name, "dump of unknown bucket");
                    Vec::new()
                }
            },
            Ok(req) => {
                debug!(method = %req.method, "unknown rpc method");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "unparseable rpc request");
                Vec::new()
            }
        };

        let reply = serde_json::to_vec(&entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}
