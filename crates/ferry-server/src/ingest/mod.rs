//! Upstream ingestion.
//!
//! A single poller owns the cursor and runs cycles strictly one after
//! another: fetch since the cursor (minus a small overlap), normalize, drop
//! blocked authors, sort by `(timestamp, id)`, keep what is newer than the
//! cursor, commit the batch with its enrichment and notifications in one
//! transaction, hand the inserted records to the hub, then advance the
//! cursor. Every Nth cycle is followed by a sweep over a trailing window
//! that catches records the upstream published late.

pub mod cursor;
pub mod poller;
pub mod source;
pub mod store;

use tokio::task::JoinHandle;
use tracing::info;

use self::poller::{now_secs, Poller};
use self::source::HttpSource;
use crate::config::ServerConfig;
use crate::db::SharedDatabase;
use crate::error::IngestError;
use crate::hub::HubHandle;

/// Restore the cursor and start the poller task. Returns `None` when no
/// upstream is configured.
pub async fn start(
    config: &ServerConfig,
    db: SharedDatabase,
    hub: HubHandle,
) -> Result<Option<JoinHandle<()>>, IngestError> {
    let Some(url) = config.source_url.clone() else {
        info!("SOURCE_URL not set, ingestion disabled");
        return Ok(None);
    };

    let source = HttpSource::new(
        url,
        config.source_auth_header.clone(),
        config.source_auth_value.clone(),
        &config.ingest,
    )?;
    let poller = Poller::bootstrap(source, db, hub, config.ingest.clone(), now_secs()).await?;
    Ok(Some(tokio::spawn(poller.run())))
}
