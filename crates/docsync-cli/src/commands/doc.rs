//! Get/set command handlers

use anyhow::{bail, Context, Result};
use automerge::{transaction::Transactable, ReadDoc, ScalarValue, Value, ROOT};

use docsync_core::document::SUBDOC_PREFIX;
use docsync_core::{Config, Doc};

use super::LocalSession;
use crate::output::{Output, OutputFormat};

/// Set a string field in the root document or one of its sub-documents
pub async fn set(
    config: &Config,
    key: String,
    value: String,
    doc_id: Option<String>,
    output: &Output,
) -> Result<()> {
    validate_key(&key)?;

    let session = LocalSession::open(config).await?;
    let doc = session.find(doc_id.as_deref())?;
    doc.change(|d| d.put(ROOT, key.as_str(), value.as_str()))
        .context("Failed to update document")?;
    session.close().await?;

    output.success(&format!("Set {} = {} in {}", key, value, doc.guid()));
    Ok(())
}

/// Print a field of the root document or one of its sub-documents
pub async fn get(
    config: &Config,
    key: String,
    doc_id: Option<String>,
    output: &Output,
) -> Result<()> {
    let session = LocalSession::open(config).await?;
    let doc = session.find(doc_id.as_deref())?;
    let value = read_field(&doc, &key);
    session.close().await?;

    let Some(value) = value else {
        bail!("No field '{}' in document {}", key, doc.guid());
    };

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "doc_id": doc.guid().to_bs58check(),
                    "key": key,
                    "value": value,
                })
            );
        }
        OutputFormat::Human | OutputFormat::Quiet => println!("{}", value),
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("Key must not be empty");
    }
    if key.starts_with(SUBDOC_PREFIX) {
        bail!(
            "Keys starting with '{}' are reserved for sub-documents",
            SUBDOC_PREFIX
        );
    }
    Ok(())
}

/// Render a root field as text
pub fn read_field(doc: &Doc, key: &str) -> Option<String> {
    doc.read(|d| match d.get(ROOT, key).ok().flatten()? {
        (Value::Scalar(scalar), _) => Some(match scalar.as_ref() {
            ScalarValue::Str(s) => s.to_string(),
            other => other.to_string(),
        }),
        (Value::Object(kind), _) => Some(format!("<{:?}>", kind)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("title").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("subdoc:abc").is_err());
    }

    #[test]
    fn test_read_field() {
        let doc = Doc::new();
        doc.change(|d| d.put(ROOT, "title", "Notes")).unwrap();
        doc.change(|d| d.put(ROOT, "pinned", true)).unwrap();

        assert_eq!(read_field(&doc, "title").as_deref(), Some("Notes"));
        assert_eq!(read_field(&doc, "pinned").as_deref(), Some("true"));
        assert!(read_field(&doc, "missing").is_none());
    }
}
