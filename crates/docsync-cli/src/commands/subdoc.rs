//! Sub-document command handlers

use anyhow::{Context, Result};
use automerge::{ReadDoc, ROOT};

use docsync_core::document::SUBDOC_PREFIX;
use docsync_core::{Config, Doc};

use super::LocalSession;
use crate::output::{truncate, Output, OutputFormat};

/// Create a sub-document under the root (or under `parent`)
pub async fn add(config: &Config, parent: Option<String>, output: &Output) -> Result<()> {
    let session = LocalSession::open(config).await?;
    let parent = session.find(parent.as_deref())?;
    let child = parent
        .create_subdoc()
        .context("Failed to create sub-document")?;
    session.close().await?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "doc_id": child.guid().to_bs58check(),
                    "parent_id": parent.guid().to_bs58check(),
                })
            );
        }
        OutputFormat::Quiet => println!("{}", child.guid()),
        OutputFormat::Human => {
            output.success(&format!("Created sub-document {}", child.guid()));
        }
    }
    Ok(())
}

/// List the sub-documents of the root (or of `parent`)
pub async fn list(config: &Config, parent: Option<String>, output: &Output) -> Result<()> {
    let session = LocalSession::open(config).await?;
    let parent = session.find(parent.as_deref())?;
    let children = parent.subdocs();
    let rows: Vec<(String, Vec<String>, usize)> = children
        .iter()
        .map(|child| (child.guid().to_string(), field_names(child), child.subdocs().len()))
        .collect();
    session.close().await?;

    match output.format {
        OutputFormat::Json => {
            let items: Vec<serde_json::Value> = rows
                .iter()
                .map(|(id, fields, nested)| {
                    serde_json::json!({
                        "doc_id": id,
                        "fields": fields,
                        "subdocs": nested,
                    })
                })
                .collect();
            println!("{}", serde_json::json!(items));
        }
        OutputFormat::Quiet => {
            for (id, _, _) in &rows {
                println!("{}", id);
            }
        }
        OutputFormat::Human => {
            if rows.is_empty() {
                println!("No sub-documents.");
                return Ok(());
            }
            for (id, fields, nested) in &rows {
                println!("{} | {} | {} nested", id, truncate(&fields.join(", "), 40), nested);
            }
            println!("\n{} sub-document(s)", rows.len());
        }
    }
    Ok(())
}

/// Root field names, without sub-document markers
fn field_names(doc: &Doc) -> Vec<String> {
    doc.read(|d| {
        d.keys(ROOT)
            .filter(|key| !key.starts_with(SUBDOC_PREFIX))
            .collect()
    })
}
