//! Wire protocol types for the suggestion process pipe.
//!
//! One JSON object per line in each direction:
//! - **stdin**: `{"id": 7, "word": "helllo"}`
//! - **stdout**: `{"suggestions": ["hello"]}` or `{"error": "..."}`
//!
//! Correlation is by arrival order. The process must answer every request
//! exactly once, in the order it read them. The `id` field is advisory: a
//! process that echoes it back lets the dispatcher detect a desynchronised
//! stream, one that ignores it still works under pure FIFO correlation.

use serde::{Deserialize, Serialize};

/// Request written to the process stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    /// Dispatcher-assigned sequence number.
    pub id: u64,
    pub word: String,
}

/// Response read from the process stdout.
///
/// `data` is accepted as an alias of `suggestions` for processors that use
/// the older field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Interpretation of a well-formed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Suggestions(Vec<String>),
    /// The process reported a failure for this word.
    Rejected(String),
    /// Valid JSON, but neither `suggestions` nor `error`.
    Empty,
}

impl LookupResponse {
    pub fn suggestions(suggestions: Vec<String>) -> Self {
        Self {
            suggestions: Some(suggestions),
            ..Self::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// An `error` field wins over `suggestions` when both are present.
    pub fn into_outcome(self) -> ResponseOutcome {
        match (self.error, self.suggestions) {
            (Some(error), _) => ResponseOutcome::Rejected(error),
            (None, Some(suggestions)) => ResponseOutcome::Suggestions(suggestions),
            (None, None) => ResponseOutcome::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes() {
        let req = LookupRequest {
            id: 7,
            word: "helllo".to_string(),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "id": 7,
          "word": "helllo"
        }
        "#);
    }

    #[test]
    fn response_accepts_data_alias() {
        let resp: LookupResponse = serde_json::from_str(r#"{"data":["hello","help"]}"#).unwrap();
        assert_eq!(
            resp.into_outcome(),
            ResponseOutcome::Suggestions(vec!["hello".to_string(), "help".to_string()])
        );
    }

    #[test]
    fn response_error_wins_over_suggestions() {
        let resp: LookupResponse =
            serde_json::from_str(r#"{"error":"boom","suggestions":["x"]}"#).unwrap();
        assert_eq!(resp.into_outcome(), ResponseOutcome::Rejected("boom".to_string()));
    }

    #[test]
    fn response_without_payload_is_empty() {
        let resp: LookupResponse = serde_json::from_str(r#"{"id":3}"#).unwrap();
        assert_eq!(resp.id, Some(3));
        assert_eq!(resp.into_outcome(), ResponseOutcome::Empty);
    }

    #[test]
    fn response_ignores_unknown_fields() {
        let resp: LookupResponse =
            serde_json::from_str(r#"{"suggestions":[],"elapsed":0.07}"#).unwrap();
        assert_eq!(resp.into_outcome(), ResponseOutcome::Suggestions(vec![]));
    }

    #[test]
    fn response_serializes_minimal() {
        let resp = LookupResponse::suggestions(vec!["world".to_string()]);
        insta::assert_json_snapshot!(resp, @r#"
        {
          "suggestions": [
            "world"
          ]
        }
        "#);
    }
}
