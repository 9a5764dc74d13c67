use serde::{Deserialize, Serialize};

/// One content-change event awaiting publication.
///
/// The payload is opaque to the pipeline; only `id` is interpreted, as the
/// per-batch dedupe key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Announcement {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}
