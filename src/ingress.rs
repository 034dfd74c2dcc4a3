//! Translates inbound bus payloads into engine calls.
//!
//! Payloads arrive either wrapped in a cloud-event envelope (`{"data": {...}}`)
//! or bare. A payload that does not name a module is attributed to the first
//! curriculum module.

use serde_json::{json, Value};
use tracing::debug;

use crate::curriculum;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::models::{Activity, ActivityType, MasteryUpdate, StruggleAlert};

const UNKNOWN_ERROR_TYPE: &str = "Unknown";

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Processed {
        update: Option<MasteryUpdate>,
        alert: Option<StruggleAlert>,
    },
    Ignored(String),
}

impl Outcome {
    fn alerted(alert: Option<StruggleAlert>) -> Self {
        Outcome::Processed {
            update: None,
            alert,
        }
    }
}

fn unwrap_envelope(payload: &Value) -> &Value {
    match payload.get("data") {
        Some(data) if data.is_object() => data,
        _ => payload,
    }
}

fn optional_str<'a>(data: &'a Value, field: &str) -> Result<Option<&'a str>, EngineError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(other) => Err(EngineError::InvalidInput(format!(
            "{field} must be a string, got {other}"
        ))),
    }
}

fn optional_number(data: &Value, field: &str) -> Result<Option<f64>, EngineError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number.as_f64().map(Some).ok_or_else(|| {
            EngineError::InvalidInput(format!("{field} is not representable as a float"))
        }),
        Some(other) => Err(EngineError::InvalidInput(format!(
            "{field} must be numeric, got {other}"
        ))),
    }
}

fn learner_id(data: &Value) -> Result<Option<&str>, EngineError> {
    match optional_str(data, "user_id")? {
        Some(id) => Ok(Some(id)),
        None => optional_str(data, "learner_id"),
    }
}

fn module_id(data: &Value) -> Result<String, EngineError> {
    Ok(optional_str(data, "module_id")?
        .unwrap_or(curriculum::first_module().id)
        .to_string())
}

/// Details object for an activity, folding a top-level `quality_score` in.
fn activity_details(data: &Value) -> Result<Value, EngineError> {
    let mut details = match data.get("details") {
        None | Some(Value::Null) => json!({}),
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(other) => {
            return Err(EngineError::InvalidInput(format!(
                "details must be an object, got {other}"
            )))
        }
    };
    if let Some(quality) = optional_number(data, "quality_score")? {
        details["quality_score"] = json!(quality);
    }
    Ok(details)
}

/// Handles `learning.events` deliveries.
pub async fn handle_learning_event(engine: &Engine, payload: &Value) -> Result<Outcome, EngineError> {
    let data = unwrap_envelope(payload);
    let Some(learner) = learner_id(data)? else {
        return Ok(Outcome::Ignored("event has no learner id".into()));
    };
    let event_type = optional_str(data, "type")?.unwrap_or_default();

    let activity_type = match event_type {
        "debug_analysis" => return handle_debug_event(engine, payload).await,
        "code_reviewed" => ActivityType::CodeExecuted,
        other => match other.parse::<ActivityType>() {
            Ok(activity_type) => activity_type,
            Err(_) => {
                debug!(learner_id = learner, event_type, "ignoring learning event");
                return Ok(Outcome::Ignored(format!("unhandled event type {event_type:?}")));
            }
        },
    };

    let status = match event_type {
        "code_executed" => execution_status(data)?,
        _ => None,
    };
    let activity = Activity {
        learner_id: learner.to_string(),
        module_id: module_id(data)?,
        activity_type,
        score: optional_number(data, "score")?.unwrap_or(0.0),
        details: activity_details(data)?,
    };
    let update = engine.record_activity(&activity).await?;

    let alert = match status {
        Some(status) => {
            engine
                .record_execution(learner, Some(activity.module_id.as_str()), &status)
                .await
        }
        None => None,
    };
    Ok(Outcome::Processed {
        update: Some(update),
        alert,
    })
}

/// Execution status from `status`, or from the `success` flag the runner
/// publishes. `None` when the payload carries neither.
fn execution_status(data: &Value) -> Result<Option<String>, EngineError> {
    match (optional_str(data, "status")?, data.get("success")) {
        (Some(status), _) => Ok(Some(status.to_string())),
        (None, Some(Value::Bool(false))) => Ok(Some("error".to_string())),
        (None, Some(Value::Bool(true))) => Ok(Some("success".to_string())),
        (None, None | Some(Value::Null)) => Ok(None),
        (None, Some(other)) => Err(EngineError::InvalidInput(format!(
            "success must be a boolean, got {other}"
        ))),
    }
}

/// Handles `code.submitted` results: the failure-run rule always sees the
/// status, and a quality score, when present, is recorded as code activity.
pub async fn handle_code_event(engine: &Engine, payload: &Value) -> Result<Outcome, EngineError> {
    let data = unwrap_envelope(payload);
    let Some(learner) = learner_id(data)? else {
        return Ok(Outcome::Ignored("event has no learner id".into()));
    };

    let status = execution_status(data)?.unwrap_or_default();
    let module = optional_str(data, "module_id")?;
    let details = activity_details(data)?;

    let update = if crate::mastery::quality_score(&details)?.is_some() {
        let activity = Activity {
            learner_id: learner.to_string(),
            module_id: module_id(data)?,
            activity_type: ActivityType::CodeExecuted,
            score: 0.0,
            details,
        };
        Some(engine.record_activity(&activity).await?)
    } else {
        None
    };

    let alert = engine.record_execution(learner, module, &status).await;
    Ok(Outcome::Processed { update, alert })
}

/// Handles the outcome of an error analysis: one count toward the
/// repeated-error rule for the reported error type.
pub async fn handle_debug_event(engine: &Engine, payload: &Value) -> Result<Outcome, EngineError> {
    let data = unwrap_envelope(payload);
    let Some(learner) = learner_id(data)? else {
        return Ok(Outcome::Ignored("event has no learner id".into()));
    };
    let error_type = optional_str(data, "error_type")?.unwrap_or(UNKNOWN_ERROR_TYPE);
    Ok(Outcome::alerted(engine.record_error(learner, error_type).await))
}

/// Handles a free-text question put to the tutor.
pub async fn handle_question(engine: &Engine, payload: &Value) -> Result<Outcome, EngineError> {
    let data = unwrap_envelope(payload);
    let Some(learner) = learner_id(data)? else {
        return Ok(Outcome::Ignored("question has no learner id".into()));
    };
    let Some(question) = optional_str(data, "question")? else {
        return Ok(Outcome::Ignored("question is empty".into()));
    };
    Ok(Outcome::alerted(engine.check_question(learner, question).await))
}

/// Dispatches one event by its signal kind: `learning`, `code`, `debug` or `question`.
pub async fn route(engine: &Engine, kind: &str, payload: &Value) -> Result<Outcome, EngineError> {
    match kind {
        "learning" => handle_learning_event(engine, payload).await,
        "code" => handle_code_event(engine, payload).await,
        "debug" => handle_debug_event(engine, payload).await,
        "question" => handle_question(engine, payload).await,
        other => Ok(Outcome::Ignored(format!("unknown signal kind {other:?}"))),
    }
}

/// Routes a stream entry of the form `{"kind": "...", ...payload}`.
pub async fn route_entry(engine: &Engine, entry: &Value) -> Result<Outcome, EngineError> {
    let Some(kind) = optional_str(entry, "kind")? else {
        return Ok(Outcome::Ignored("entry has no kind".into()));
    };
    route(engine, kind, entry).await
}
