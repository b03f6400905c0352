//! Status command handler

use anyhow::{Context, Result};

use docsync_core::{Config, FsStorage, Identity};

use crate::output::{Output, OutputFormat};

/// Show root document, directories and local storage usage
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let identity = Identity::with_config(config.clone());
    let root_id = identity.require_root_id()?;
    let storage = FsStorage::open("local", config.storage_dir())
        .context("Failed to open local storage")?;
    let stats = storage.stats().context("Failed to read local storage")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "root_id": root_id.to_bs58check(),
                    "data_dir": config.data_dir,
                    "remote_dir": config.remote_dir,
                    "storage": {
                        "document_count": stats.document_count,
                        "total_size": stats.total_size,
                        "root_stored": storage.exists(&root_id),
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", root_id);
        }
        OutputFormat::Human => {
            println!("docsync Status");
            println!("==============");
            println!();
            println!("Root Document:");
            println!("  ID:     {}", root_id);
            println!(
                "  Stored: {}",
                if storage.exists(&root_id) {
                    "yes"
                } else {
                    "no (run `docsync sync` to fetch it)"
                }
            );
            println!();
            println!("Sync:");
            match config.remote_dir {
                Some(ref dir) => println!("  Remote: {}", dir.display()),
                None => println!("  Remote: (not set)"),
            }
            println!("  Retry:  every {}s", config.retry_delay_secs);
            println!();
            println!("Storage:");
            println!("  Location:  {}", config.storage_dir().display());
            println!("  Documents: {}", stats.document_count);
            println!("  Size:      {}", stats.total_size_human());
        }
    }

    Ok(())
}
