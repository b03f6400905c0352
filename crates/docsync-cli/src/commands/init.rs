//! Init command handler

use anyhow::Result;

use docsync_core::{Config, DocumentId, Identity};

use crate::output::{Output, OutputFormat};

/// Create a root document ID, or adopt `join` to replicate an existing tree
pub fn init(config: &Config, join: Option<String>, output: &Output) -> Result<()> {
    let identity = Identity::with_config(config.clone());

    let result = match join {
        Some(id) => {
            let root_id = DocumentId::from_bs58check(&id)
                .map_err(|e| anyhow::anyhow!("Invalid root document ID: {}", e))?;
            identity.join(root_id)?
        }
        None => identity.initialize()?,
    };

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "root_id": result.root_id.to_bs58check(),
                    "is_new": result.is_new,
                    "data_dir": identity.data_dir(),
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", result.root_id);
        }
        OutputFormat::Human => {
            if result.is_new {
                println!("Initialized.");
            } else {
                println!("Already initialized.");
            }
            println!("Root document ID: {}", result.root_id);
            println!("Data directory:   {}", identity.data_dir().display());
            if config.remote_dir.is_none() {
                println!();
                println!("No remote configured. Sync with a shared directory using:");
                println!("  docsync sync --remote /path/to/shared/dir");
            }
        }
    }

    Ok(())
}
