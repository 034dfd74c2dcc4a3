use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::models::{StruggleAlert, StruggleType};

pub const LOW_QUIZ_SCORE: f64 = 50.0;
pub const FAILURE_THRESHOLD: u32 = 5;
pub const REPEATED_ERROR_THRESHOLD: u32 = 3;

const DISTRESS_PHRASES: &[&str] = &[
    "i'm stuck",
    "i am stuck",
    "i don't understand",
    "i dont understand",
    "give up",
    "too hard",
    "confused",
    "i'm lost",
    "help me",
    "what am i doing wrong",
    "doesn't make sense",
    "i can't figure",
    "i cant figure",
];

/// Fires on every low quiz, no debounce.
pub fn check_quiz(
    learner_id: &str,
    module_id: &str,
    score: f64,
    now: DateTime<Utc>,
) -> Option<StruggleAlert> {
    (score < LOW_QUIZ_SCORE).then(|| {
        StruggleAlert::new(
            learner_id,
            StruggleType::LowQuizScore,
            Some(module_id),
            json!({ "score": score }),
            now,
        )
    })
}

pub fn distress_phrase(question: &str) -> Option<&'static str> {
    let normalized = question.to_lowercase().replace('\u{2019}', "'");
    DISTRESS_PHRASES
        .iter()
        .copied()
        .find(|phrase| normalized.contains(phrase))
}

/// At most one alert per question, whatever the number of phrases matched.
pub fn check_question(
    learner_id: &str,
    question: &str,
    now: DateTime<Utc>,
) -> Option<StruggleAlert> {
    distress_phrase(question).map(|phrase| {
        StruggleAlert::new(
            learner_id,
            StruggleType::VerbalExpression,
            None,
            json!({ "matched_phrase": phrase, "question": question }),
            now,
        )
    })
}

/// Counter-based rules. Counters are volatile and reset after each firing.
#[derive(Debug, Default)]
pub struct StruggleDetector {
    failures: Mutex<HashMap<String, u32>>,
    errors: Mutex<HashMap<String, HashMap<String, u32>>>,
}

impl StruggleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks consecutive execution failures; any non-error status clears the run.
    pub fn record_execution(
        &self,
        learner_id: &str,
        module_id: Option<&str>,
        status: &str,
        now: DateTime<Utc>,
    ) -> Option<StruggleAlert> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);

        if status != "error" {
            failures.remove(learner_id);
            return None;
        }

        let count = failures.entry(learner_id.to_string()).or_insert(0);
        *count += 1;
        if *count < FAILURE_THRESHOLD {
            return None;
        }

        let fired = *count;
        *count = 0;
        Some(StruggleAlert::new(
            learner_id,
            StruggleType::RepeatedFailures,
            module_id,
            json!({ "consecutive_failures": fired }),
            now,
        ))
    }

    /// Counts occurrences of one error type; only that type's counter resets on firing.
    pub fn record_error(
        &self,
        learner_id: &str,
        error_type: &str,
        now: DateTime<Utc>,
    ) -> Option<StruggleAlert> {
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        let count = errors
            .entry(learner_id.to_string())
            .or_default()
            .entry(error_type.to_string())
            .or_insert(0);
        *count += 1;
        if *count < REPEATED_ERROR_THRESHOLD {
            return None;
        }

        let fired = *count;
        *count = 0;
        Some(StruggleAlert::new(
            learner_id,
            StruggleType::RepeatedError,
            None,
            json!({ "error_type": error_type, "count": fired }),
            now,
        ))
    }

    #[cfg(test)]
    pub fn consecutive_failures(&self, learner_id: &str) -> u32 {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.get(learner_id).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn error_count(&self, learner_id: &str, error_type: &str) -> u32 {
        let errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        errors
            .get(learner_id)
            .and_then(|counts| counts.get(error_type))
            .copied()
            .unwrap_or(0)
    }
}
