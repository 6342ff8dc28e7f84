//! Domain models for indexed surveys, responses, and results markers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Question kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    /// Pick exactly one option
    Single,
    /// Pick any number of options
    Multi,
    /// Free text
    Text,
}

impl QuestionType {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "single" => Some(Self::Single),
            "multi" => Some(Self::Multi),
            "text" => Some(Self::Text),
            _ => None,
        }
    }
}

/// A selectable answer for a choice question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Caller-supplied, stable across edits
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    #[serde(default)]
    pub required: bool,
    /// Empty for free-text questions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<QuestionOption>,
}

/// The structural part of a survey, stored as one JSON document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyDefinition {
    pub questions: Vec<Question>,
    #[serde(default)]
    pub anonymous: bool,
}

/// A survey record as decoded from the firehose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurveyRecord {
    /// External `name` field
    pub title: String,
    pub description: Option<String>,
    pub definition: SurveyDefinition,
}

/// One answer to one question.
///
/// Both fields may be populated; which one is meaningful depends on the
/// question type and is not cross-checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A response record as decoded from the firehose.
///
/// Carries no voter; identity comes from the event envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub survey_uri: String,
    pub survey_cid: Option<String>,
    pub answers: BTreeMap<String, Answer>,
}

/// A results record as decoded from the firehose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsRecord {
    pub survey_uri: String,
}

// ============================================================================
// Stored rows
// ============================================================================

/// An indexed survey
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    pub id: Uuid,
    /// Unique, assigned at creation and never regenerated
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub definition: SurveyDefinition,
    /// Owning repository
    pub author_did: String,
    pub record_key: String,
    pub uri: String,
    pub cid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An indexed response; at most one per (voter, survey)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub survey_id: Uuid,
    pub voter_did: String,
    pub record_uri: String,
    pub record_cid: Option<String>,
    /// Version of the survey the voter answered, when the response names one
    pub survey_cid: Option<String>,
    pub answers: BTreeMap<String, Answer>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Marker that a survey owner published anonymized results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsPublication {
    pub survey_id: Uuid,
    pub record_uri: String,
    pub record_cid: Option<String>,
    pub publisher_did: String,
    pub published_at: DateTime<Utc>,
}
