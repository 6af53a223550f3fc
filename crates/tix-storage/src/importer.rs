use async_trait::async_trait;
use serde::Deserialize;
use tix_core::IncidentPayload;
use tracing::{info_span, warn, Instrument};

use crate::store::{IncidentStore, StoreError, UpsertStats};

/// Posts each batch as a JSON array to a remote importer endpoint that performs
/// the upsert on its side.
#[derive(Debug, Clone)]
pub struct ImporterStore {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ImporterReply {
    message: Option<String>,
    inserted: Option<usize>,
    updated: Option<usize>,
}

impl ImporterStore {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Importer scripts tend to leak warnings around their JSON; keep the outermost object.
fn extract_reply(text: &str) -> Option<ImporterReply> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn interpret_reply(status: u16, text: &str, batch_len: usize) -> Result<UpsertStats, StoreError> {
    if text.trim().is_empty() {
        return Err(StoreError::Importer {
            status,
            message: "the importer returned an empty response, which usually means it crashed".to_string(),
        });
    }
    let Some(reply) = extract_reply(text) else {
        return Err(StoreError::Importer {
            status,
            message: "could not find a JSON object in the importer response".to_string(),
        });
    };
    if !(200..300).contains(&status) {
        return Err(StoreError::Importer {
            status,
            message: reply
                .message
                .unwrap_or_else(|| format!("importer failed with status {status}")),
        });
    }
    // Importers that do not report a breakdown are counted as inserts.
    Ok(match (reply.inserted, reply.updated) {
        (None, None) => UpsertStats {
            inserted: batch_len,
            updated: 0,
        },
        (inserted, updated) => UpsertStats {
            inserted: inserted.unwrap_or(0),
            updated: updated.unwrap_or(0),
        },
    })
}

#[async_trait]
impl IncidentStore for ImporterStore {
    async fn upsert_batch(&self, batch: &[IncidentPayload]) -> Result<UpsertStats, StoreError> {
        let span = info_span!("importer_post", url = %self.url, batch = batch.len());
        async {
            let response = self.client.post(&self.url).json(batch).send().await?;
            let status = response.status().as_u16();
            let text = response.text().await?;
            interpret_reply(status, &text, batch.len()).inspect_err(|err| {
                warn!(error = %err, "importer rejected batch");
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noisy_success_reply_is_parsed() {
        let text = "Notice: something\n{\"message\":\"ok\",\"inserted\":3,\"updated\":2}\n";
        let stats = interpret_reply(200, text, 5).unwrap();
        assert_eq!(stats, UpsertStats { inserted: 3, updated: 2 });
    }

    #[test]
    fn reply_without_breakdown_counts_whole_batch() {
        let stats = interpret_reply(200, "{\"message\":\"Imported\"}", 7).unwrap();
        assert_eq!(stats.total(), 7);
    }

    #[test]
    fn empty_and_non_json_replies_are_errors() {
        let err = interpret_reply(500, "  ", 1).unwrap_err();
        assert!(err.to_string().contains("empty response"));
        let err = interpret_reply(200, "<html>oops</html>", 1).unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }

    #[test]
    fn error_status_surfaces_importer_message() {
        let err = interpret_reply(413, "{\"message\":\"payload too large\"}", 1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "importer responded with status 413: payload too large"
        );
    }
}
