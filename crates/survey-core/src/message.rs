//! Message types for the survey indexer
//!
//! Defines the firehose frame as it arrives on the wire and the typed
//! [`StreamEvent`] it is classified into at the boundary. Nothing past
//! [`Frame::classify`] sees the open wire structure except the record body,
//! which the record decoder consumes.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An untyped record body as delivered by the firehose
pub type Record = Map<String, Value>;

/// Survey definition collection NSID
pub const SURVEY_COLLECTION: &str = "net.openmeet.survey";
/// Survey response collection NSID
pub const RESPONSE_COLLECTION: &str = "net.openmeet.survey.response";
/// Published results collection NSID
pub const RESULTS_COLLECTION: &str = "net.openmeet.survey.results";

/// Collections this indexer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Survey,
    Response,
    Results,
}

impl Collection {
    /// Every known collection, in subscription order
    pub const ALL: [Collection; 3] = [Self::Survey, Self::Response, Self::Results];

    /// The namespaced identifier used on the wire
    pub fn nsid(&self) -> &'static str {
        match self {
            Self::Survey => SURVEY_COLLECTION,
            Self::Response => RESPONSE_COLLECTION,
            Self::Results => RESULTS_COLLECTION,
        }
    }

    /// Resolve a wire NSID
    pub fn from_nsid(nsid: &str) -> Option<Self> {
        match nsid {
            SURVEY_COLLECTION => Some(Self::Survey),
            RESPONSE_COLLECTION => Some(Self::Response),
            RESULTS_COLLECTION => Some(Self::Results),
            _ => None,
        }
    }

    /// Short label for metrics and logs
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Survey => "survey",
            Self::Response => "response",
            Self::Results => "results",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.nsid())
    }
}

/// Record operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Parse the wire spelling
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Check if this operation requires a record body
    pub fn requires_body(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the AT-URI addressing a record
pub fn at_uri(repository: &str, collection: &str, record_key: &str) -> String {
    format!("at://{}/{}/{}", repository, collection, record_key)
}

// ============================================================================
// Wire format
// ============================================================================

/// One frame from the firehose, exactly as it arrives
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    /// Authenticated repository that emitted the event
    #[serde(default)]
    pub did: Option<String>,

    /// Time ordinate in microseconds; the resumption token
    pub time_us: i64,

    /// `commit`, `identity`, `account`, ...
    pub kind: String,

    /// Present for commit frames
    #[serde(default)]
    pub commit: Option<RawCommit>,
}

/// Commit object inside a frame.
///
/// Every field is optional here so that a readable frame with a broken commit
/// still yields its sequence; [`Frame::classify`] names the missing field.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCommit {
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub rkey: Option<String>,
    /// Fallback repository when the frame carries no top-level `did`
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub cid: Option<String>,
}

/// Result of classifying a frame
#[derive(Debug, Clone)]
pub enum Envelope {
    /// A commit for one of our collections
    Commit(StreamEvent),
    /// A commit for a collection we do not index; the cursor still advances
    UnknownCollection { sequence: i64, collection: String },
    /// Not a commit at all (identity/account updates)
    NonCommit { sequence: i64, kind: String },
}

/// A commit frame whose envelope is malformed; carries the sequence so the
/// cursor can still move past it.
#[derive(Debug, Clone)]
pub struct RejectedFrame {
    pub sequence: i64,
    pub collection: Option<Collection>,
    pub operation: Option<Operation>,
    pub record_key: Option<String>,
    pub error: DecodeError,
}

impl Frame {
    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Frame(e.to_string()))
    }

    /// Turn the open wire shape into a typed envelope
    pub fn classify(self) -> Result<Envelope, RejectedFrame> {
        let sequence = self.time_us;

        let commit = match (self.kind.as_str(), self.commit) {
            ("commit", Some(commit)) => commit,
            (kind, _) => {
                return Ok(Envelope::NonCommit {
                    sequence,
                    kind: kind.to_string(),
                })
            }
        };

        let operation = commit.operation.as_deref().and_then(Operation::parse);
        let record_key = commit.rkey.clone().filter(|k| !k.is_empty());
        let reject = |collection: Option<Collection>, error: DecodeError| RejectedFrame {
            sequence,
            collection,
            operation,
            record_key: record_key.clone(),
            error,
        };

        let collection = match commit.collection.as_deref() {
            None | Some("") => return Err(reject(None, DecodeError::missing("commit.collection"))),
            Some(nsid) => match Collection::from_nsid(nsid) {
                Some(collection) => collection,
                None => {
                    return Ok(Envelope::UnknownCollection {
                        sequence,
                        collection: nsid.to_string(),
                    })
                }
            },
        };

        let operation = match (commit.operation.as_deref(), operation) {
            (_, Some(operation)) => operation,
            (None, _) | (Some(""), _) => {
                return Err(reject(Some(collection), DecodeError::missing("commit.operation")))
            }
            (Some(raw), None) => {
                return Err(reject(
                    Some(collection),
                    DecodeError::UnknownOperation(raw.to_string()),
                ))
            }
        };

        let repository = self
            .did
            .or_else(|| commit.repo.clone())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| reject(Some(collection), DecodeError::missing("did")))?;

        let record_key = record_key
            .clone()
            .ok_or_else(|| reject(Some(collection), DecodeError::missing("commit.rkey")))?;

        let payload = if operation.requires_body() {
            match commit.record {
                Some(Value::Object(record)) => Some(record),
                None | Some(Value::Null) => {
                    return Err(reject(Some(collection), DecodeError::missing("commit.record")))
                }
                Some(_) => {
                    return Err(reject(
                        Some(collection),
                        DecodeError::malformed("commit.record", "an object"),
                    ))
                }
            }
        } else {
            None
        };

        Ok(Envelope::Commit(StreamEvent {
            collection,
            operation,
            repository,
            record_key,
            sequence,
            cid: commit.cid,
            payload,
        }))
    }
}

// ============================================================================
// Typed event
// ============================================================================

/// A decoded firehose commit for one of the indexed collections
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub collection: Collection,
    pub operation: Operation,
    /// Authenticated repository (DID) that owns the record
    pub repository: String,
    pub record_key: String,
    /// Microsecond time ordinate; ordering key and resumption token
    pub sequence: i64,
    /// Content hash of the record version
    pub cid: Option<String>,
    /// Raw record body (absent for deletes)
    pub payload: Option<Record>,
}

impl StreamEvent {
    /// AT-URI of the record this event touches
    pub fn uri(&self) -> String {
        at_uri(&self.repository, self.collection.nsid(), &self.record_key)
    }

    /// Create event builder
    pub fn create(
        collection: Collection,
        repository: impl Into<String>,
        record_key: impl Into<String>,
        sequence: i64,
        payload: Record,
    ) -> Self {
        Self {
            collection,
            operation: Operation::Create,
            repository: repository.into(),
            record_key: record_key.into(),
            sequence,
            cid: None,
            payload: Some(payload),
        }
    }

    /// Update event builder
    pub fn update(
        collection: Collection,
        repository: impl Into<String>,
        record_key: impl Into<String>,
        sequence: i64,
        payload: Record,
    ) -> Self {
        Self {
            operation: Operation::Update,
            ..Self::create(collection, repository, record_key, sequence, payload)
        }
    }

    /// Delete event builder
    pub fn delete(
        collection: Collection,
        repository: impl Into<String>,
        record_key: impl Into<String>,
        sequence: i64,
    ) -> Self {
        Self {
            collection,
            operation: Operation::Delete,
            repository: repository.into(),
            record_key: record_key.into(),
            sequence,
            cid: None,
            payload: None,
        }
    }

    /// Builder: set cid
    pub fn with_cid(mut self, cid: impl Into<String>) -> Self {
        self.cid = Some(cid.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(value: Value) -> Result<Envelope, RejectedFrame> {
        let bytes = serde_json::to_vec(&value).unwrap();
        Frame::from_bytes(&bytes).unwrap().classify()
    }

    #[test]
    fn test_commit_frame_classification() {
        let envelope = classify(json!({
            "did": "did:plc:alice",
            "time_us": 1725911162329308i64,
            "kind": "commit",
            "commit": {
                "rev": "3l3qo2vutsw2b",
                "operation": "create",
                "collection": "net.openmeet.survey",
                "rkey": "3l3qo2vuowo2b",
                "record": {"name": "Coffee"},
                "cid": "bafyreia"
            }
        }))
        .unwrap();

        let Envelope::Commit(event) = envelope else {
            panic!("expected commit");
        };
        assert_eq!(event.collection, Collection::Survey);
        assert_eq!(event.operation, Operation::Create);
        assert_eq!(event.repository, "did:plc:alice");
        assert_eq!(event.sequence, 1725911162329308);
        assert_eq!(event.cid.as_deref(), Some("bafyreia"));
        assert_eq!(
            event.uri(),
            "at://did:plc:alice/net.openmeet.survey/3l3qo2vuowo2b"
        );
    }

    #[test]
    fn test_commit_repo_fallback() {
        let envelope = classify(json!({
            "time_us": 5,
            "kind": "commit",
            "commit": {
                "operation": "delete",
                "collection": "net.openmeet.survey.response",
                "rkey": "abc",
                "repo": "did:plc:bob"
            }
        }))
        .unwrap();

        let Envelope::Commit(event) = envelope else {
            panic!("expected commit");
        };
        assert_eq!(event.repository, "did:plc:bob");
        assert!(event.payload.is_none());
    }

    #[test]
    fn test_unknown_collection_and_non_commit() {
        let envelope = classify(json!({
            "did": "did:plc:alice",
            "time_us": 7,
            "kind": "commit",
            "commit": {"operation": "create", "collection": "app.bsky.feed.like", "rkey": "x", "record": {}}
        }))
        .unwrap();
        assert!(matches!(envelope, Envelope::UnknownCollection { sequence: 7, .. }));

        let envelope = classify(json!({"did": "did:plc:alice", "time_us": 8, "kind": "identity"})).unwrap();
        assert!(matches!(envelope, Envelope::NonCommit { sequence: 8, .. }));
    }

    #[test]
    fn test_malformed_commit_keeps_sequence() {
        let rejected = classify(json!({
            "did": "did:plc:alice",
            "time_us": 9,
            "kind": "commit",
            "commit": {"operation": "upsert", "collection": "net.openmeet.survey", "rkey": "x"}
        }))
        .unwrap_err();
        assert_eq!(rejected.sequence, 9);
        assert_eq!(rejected.error, DecodeError::UnknownOperation("upsert".into()));

        let rejected = classify(json!({
            "did": "did:plc:alice",
            "time_us": 10,
            "kind": "commit",
            "commit": {"operation": "update", "collection": "net.openmeet.survey", "rkey": "x"}
        }))
        .unwrap_err();
        assert_eq!(rejected.error, DecodeError::missing("commit.record"));
        assert_eq!(rejected.collection, Some(Collection::Survey));
        assert_eq!(rejected.operation, Some(Operation::Update));
        assert_eq!(rejected.record_key.as_deref(), Some("x"));
    }

    #[test]
    fn test_incomplete_commit_is_rejected_not_unparseable() {
        let cases = [
            (
                json!({"operation": "create", "collection": "net.openmeet.survey", "record": {}}),
                DecodeError::missing("commit.rkey"),
            ),
            (
                json!({"operation": "create", "collection": "net.openmeet.survey", "rkey": "x", "record": "oops"}),
                DecodeError::malformed("commit.record", "an object"),
            ),
            (
                json!({"collection": "net.openmeet.survey.response", "rkey": "x", "record": {}}),
                DecodeError::missing("commit.operation"),
            ),
            (
                json!({"operation": "delete", "rkey": "x"}),
                DecodeError::missing("commit.collection"),
            ),
        ];

        for (i, (commit, expected)) in cases.into_iter().enumerate() {
            let rejected = classify(json!({
                "did": "did:plc:alice",
                "time_us": 500 + i as i64,
                "kind": "commit",
                "commit": commit
            }))
            .unwrap_err();
            assert_eq!(rejected.sequence, 500 + i as i64);
            assert_eq!(rejected.error, expected);
        }
    }

    #[test]
    fn test_delete_ignores_record_shape() {
        let envelope = classify(json!({
            "did": "did:plc:alice",
            "time_us": 11,
            "kind": "commit",
            "commit": {"operation": "delete", "collection": "net.openmeet.survey", "rkey": "x", "record": "stale"}
        }))
        .unwrap();
        let Envelope::Commit(event) = envelope else {
            panic!("expected commit");
        };
        assert!(event.payload.is_none());
    }

    #[test]
    fn test_garbage_frame() {
        assert!(matches!(
            Frame::from_bytes(b"not json"),
            Err(DecodeError::Frame(_))
        ));
    }
}
