//! Sync command handler

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use docsync_core::{Config, Doc, FsStorage, Identity, StorageAdapter, SyncEngine, SyncError};

use crate::output::Output;

/// Replicate the local tree with a remote directory until both are in sync
pub async fn sync(
    config: &Config,
    remote: Option<PathBuf>,
    timeout_secs: u64,
    output: &Output,
) -> Result<()> {
    let Some(remote_dir) = remote.or_else(|| config.remote_dir.clone()) else {
        bail!(
            "No remote configured. Pass one with:\n  \
             docsync sync --remote /path/to/shared/dir\n\
             or set it with:\n  \
             docsync config set remote_dir /path/to/shared/dir"
        );
    };

    let root_id = Identity::with_config(config.clone()).require_root_id()?;
    let local = FsStorage::open("local", config.storage_dir())
        .context("Failed to open local storage")?;
    let remote = FsStorage::open("remote", &remote_dir)
        .with_context(|| format!("Failed to open remote directory {:?}", remote_dir))?;

    output.message(&format!(
        "Syncing {} with {}...",
        root_id,
        remote_dir.display()
    ));

    let remotes: Vec<Arc<dyn StorageAdapter>> = vec![Arc::new(remote)];
    let engine = SyncEngine::new(
        Doc::with_guid(root_id),
        Arc::new(local),
        remotes,
        config.peer_config(),
    );

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
                cancel.cancel();
            }
        })
    };

    let waited = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        engine.wait_for_synced(Some(&cancel)),
    )
    .await;
    interrupt.abort();

    let status = engine.status();
    engine.shutdown().await;

    match waited {
        Ok(Ok(())) => {
            output.print_sync_status(&status);
            output.success(&format!("Sync complete ({} documents)", status.local.loaded_docs));
            Ok(())
        }
        Ok(Err(SyncError::Cancelled)) => {
            output.print_sync_status(&status);
            bail!("Sync interrupted")
        }
        Ok(Err(e)) => Err(e).context("Sync failed"),
        Err(_) => {
            output.print_sync_status(&status);
            bail!("Sync did not finish within {}s", timeout_secs)
        }
    }
}
