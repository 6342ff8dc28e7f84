//! Record decoding
//!
//! Pure functions that turn the loosely-typed record bodies carried by the
//! firehose into typed values. The lexicon differs from our model in a few
//! places, and those differences are reproduced here:
//!
//! - survey `name` becomes `title`
//! - question `type` is a token such as `net.openmeet.survey#single`; only the
//!   segment after the last `#` is kept
//! - answers list their choices under `selectedOptions`
//! - response bodies never carry the voter; that comes from the envelope
//!
//! Errors name the first failing field, e.g. `questions[2].options[0].text`.

use crate::error::DecodeError;
use crate::message::{Collection, Operation, Record, StreamEvent};
use crate::model::{
    Answer, Question, QuestionOption, QuestionType, ResponseRecord, ResultsRecord, SurveyDefinition,
    SurveyRecord,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Separator between a lexicon namespace and the token name
pub const TOKEN_SEPARATOR: char = '#';

/// Decoded event body, one variant per collection and operation
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    SurveyCreate(SurveyRecord),
    SurveyUpdate(SurveyRecord),
    SurveyDelete,
    ResponseCreate(ResponseRecord),
    ResponseUpdate(ResponseRecord),
    ResponseDelete,
    ResultsCreate(ResultsRecord),
    ResultsUpdate(ResultsRecord),
    ResultsDelete,
}

/// Decode the payload of a classified event
pub fn decode_event(event: &StreamEvent) -> Result<EventBody, DecodeError> {
    let payload = || {
        event
            .payload
            .as_ref()
            .ok_or_else(|| DecodeError::missing("record"))
    };

    let body = match (event.collection, event.operation) {
        (Collection::Survey, Operation::Create) => EventBody::SurveyCreate(decode_survey(payload()?)?),
        (Collection::Survey, Operation::Update) => EventBody::SurveyUpdate(decode_survey(payload()?)?),
        (Collection::Survey, Operation::Delete) => EventBody::SurveyDelete,
        (Collection::Response, Operation::Create) => {
            EventBody::ResponseCreate(decode_response(payload()?)?)
        }
        (Collection::Response, Operation::Update) => {
            EventBody::ResponseUpdate(decode_response(payload()?)?)
        }
        (Collection::Response, Operation::Delete) => EventBody::ResponseDelete,
        (Collection::Results, Operation::Create) => {
            EventBody::ResultsCreate(decode_results(payload()?)?)
        }
        (Collection::Results, Operation::Update) => {
            EventBody::ResultsUpdate(decode_results(payload()?)?)
        }
        (Collection::Results, Operation::Delete) => EventBody::ResultsDelete,
    };

    Ok(body)
}

// ============================================================================
// Survey
// ============================================================================

/// Decode a survey definition record
pub fn decode_survey(record: &Record) -> Result<SurveyRecord, DecodeError> {
    let title = required_str(record, "name", "name")?;
    let description = optional_str(record, "description", "description")?;
    let anonymous = optional_bool(record, "anonymous", "anonymous")?;

    let questions_raw = match record.get("questions") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) | None | Some(Value::Null) => {
            return Err(DecodeError::missing("questions"))
        }
        Some(_) => return Err(DecodeError::malformed("questions", "an array")),
    };

    let questions = questions_raw
        .iter()
        .enumerate()
        .map(|(i, raw)| decode_question(raw, i))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SurveyRecord {
        title,
        description,
        definition: SurveyDefinition {
            questions,
            anonymous,
        },
    })
}

fn decode_question(raw: &Value, index: usize) -> Result<Question, DecodeError> {
    let path = format!("questions[{}]", index);
    let obj = raw
        .as_object()
        .ok_or_else(|| DecodeError::malformed(path.clone(), "an object"))?;

    let id = required_str(obj, "id", &format!("{}.id", path))?;
    let text = required_str(obj, "text", &format!("{}.text", path))?;

    let type_path = format!("{}.type", path);
    let token = required_str(obj, "type", &type_path)?;
    let question_type = QuestionType::parse(strip_token_prefix(&token))
        .ok_or_else(|| DecodeError::malformed(type_path, "one of single, multi, text"))?;

    let required = optional_bool(obj, "required", &format!("{}.required", path))?;

    let options = match obj.get("options") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(j, raw)| decode_option(raw, &format!("{}.options[{}]", path, j)))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(DecodeError::malformed(format!("{}.options", path), "an array")),
    };

    Ok(Question {
        id,
        text,
        question_type,
        required,
        options,
    })
}

fn decode_option(raw: &Value, path: &str) -> Result<QuestionOption, DecodeError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| DecodeError::malformed(path, "an object"))?;

    Ok(QuestionOption {
        id: required_str(obj, "id", &format!("{}.id", path))?,
        text: required_str(obj, "text", &format!("{}.text", path))?,
    })
}

/// `net.openmeet.survey#single` becomes `single`; untokenized values pass through
pub fn strip_token_prefix(token: &str) -> &str {
    token
        .rsplit_once(TOKEN_SEPARATOR)
        .map_or(token, |(_, name)| name)
}

// ============================================================================
// Response
// ============================================================================

/// Decode a survey response record
pub fn decode_response(record: &Record) -> Result<ResponseRecord, DecodeError> {
    let (survey_uri, survey_cid) = decode_subject(record)?;

    let answers_raw = match record.get("answers") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) | None | Some(Value::Null) => {
            return Err(DecodeError::missing("answers"))
        }
        Some(_) => return Err(DecodeError::malformed("answers", "an array")),
    };

    let mut answers = BTreeMap::new();
    for (i, raw) in answers_raw.iter().enumerate() {
        let path = format!("answers[{}]", i);
        let obj = raw
            .as_object()
            .ok_or_else(|| DecodeError::malformed(path.clone(), "an object"))?;

        let question_id = required_str(obj, "questionId", &format!("{}.questionId", path))?;

        let selected_options = match obj.get("selectedOptions") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(j, v)| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        DecodeError::malformed(
                            format!("{}.selectedOptions[{}]", path, j),
                            "a string",
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(DecodeError::malformed(
                    format!("{}.selectedOptions", path),
                    "an array",
                ))
            }
        };

        let text = optional_str(obj, "text", &format!("{}.text", path))?;

        answers.insert(
            question_id,
            Answer {
                selected_options,
                text,
            },
        );
    }

    Ok(ResponseRecord {
        survey_uri,
        survey_cid,
        answers,
    })
}

// ============================================================================
// Results
// ============================================================================

/// Decode a results publication record; only the subject is read
pub fn decode_results(record: &Record) -> Result<ResultsRecord, DecodeError> {
    let (survey_uri, _) = decode_subject(record)?;
    Ok(ResultsRecord { survey_uri })
}

fn decode_subject(record: &Record) -> Result<(String, Option<String>), DecodeError> {
    let subject = match record.get("subject") {
        Some(Value::Object(obj)) => obj,
        None | Some(Value::Null) => return Err(DecodeError::missing("subject")),
        Some(_) => return Err(DecodeError::malformed("subject", "an object")),
    };

    let uri = required_str(subject, "uri", "subject.uri")?;
    let cid = optional_str(subject, "cid", "subject.cid")?;
    Ok((uri, cid))
}

// ============================================================================
// Field helpers
// ============================================================================

fn required_str(obj: &Record, key: &str, path: &str) -> Result<String, DecodeError> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(DecodeError::missing(path)),
        Some(_) => Err(DecodeError::malformed(path, "a string")),
    }
}

fn optional_str(obj: &Record, key: &str, path: &str) -> Result<Option<String>, DecodeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DecodeError::malformed(path, "a string")),
    }
}

fn optional_bool(obj: &Record, key: &str, path: &str) -> Result<bool, DecodeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(DecodeError::malformed(path, "a boolean")),
    }
}
