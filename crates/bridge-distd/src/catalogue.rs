//! Loading the bridge catalogue.
//!
//! The catalogue is a JSON array of bridge records, produced by
//! whatever measures and sanitises the deployment's bridges.  We read
//! it whole and atomically swap it into the splitter, both at startup
//! and on a timer, so a half-written reload never mixes with the
//! previous catalogue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tokio::time;
use tracing::{debug, info, warn};

use bridge_hashring::{Bridge, BridgeSplitter};

/// Read the catalogue at `path`.
///
/// Bridges marked not running are dropped here: handing out a dead
/// bridge is worse than handing out one fewer.
pub(crate) fn load_bridges(path: &Path) -> anyhow::Result<Vec<Arc<Bridge>>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading catalogue {:?}", path))?;
    let bridges: Vec<Bridge> =
        serde_json::from_str(&text).with_context(|| format!("parsing catalogue {:?}", path))?;
    let total = bridges.len();
    let usable: Vec<Arc<Bridge>> = bridges
        .into_iter()
        .filter(|b| {
            if !b.running {
                debug!("skipping non-running bridge {}", b.fingerprint);
            }
            b.running
        })
        .map(Arc::new)
        .collect();
    info!("catalogue {:?}: {} bridges, {} usable", path, total, usable.len());
    Ok(usable)
}

/// Load the catalogue into `splitter` once.
pub(crate) fn reload_once(splitter: &BridgeSplitter, path: &Path) -> anyhow::Result<()> {
    let bridges = load_bridges(path)?;
    splitter.reload(bridges, SystemTime::now());
    Ok(())
}

/// Re-read the catalogue every `interval`, forever.
///
/// A failed read keeps the previous catalogue: a missing or garbled
/// file during rotation must not empty the deployment.
pub(crate) async fn reload_task(
    splitter: Arc<BridgeSplitter>,
    path: PathBuf,
    interval: Duration,
) {
    let mut ticker = time::interval(interval.max(Duration::from_secs(1)));
    // The first tick fires immediately; the catalogue was already
    // loaded at startup.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = reload_once(&splitter, &path) {
            warn!("catalogue reload failed; keeping previous catalogue: {:#}", e);
        }
    }
}
