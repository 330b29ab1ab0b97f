use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bucket::BucketSet;
use crate::config::load_from_path;
use crate::Result;

/// Re-read the config file on every SIGHUP and push it into the
/// buckets.
///
/// A file that no longer parses is logged and ignored; the running
/// configuration stays in force. Bucket entries survive the reload and
/// the listeners are untouched.
pub fn spawn_reload_task(
    path: PathBuf,
    buckets: Arc<BucketSet>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    warn!("SIGHUP received, reloading config");
                    match load_from_path(&path) {
                        Ok(config) => {
                            buckets.set_config(&config);
                            info!("configuration reloaded");
                            if config.debug {
                                info!(?config, "effective configuration");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "refusing to reload on unusable config file");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("reload task stopped");
                    break;
                }
            }
        }
    }))
}
