use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::curriculum::Module;
use crate::error::EngineError;

pub const LEARNING_TOPIC: &str = "learning.events";
pub const STRUGGLE_TOPIC: &str = "struggle.detected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ExerciseCompleted,
    QuizTaken,
    CodeExecuted,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::ExerciseCompleted => "exercise_completed",
            ActivityType::QuizTaken => "quiz_taken",
            ActivityType::CodeExecuted => "code_executed",
        }
    }
}

impl FromStr for ActivityType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exercise_completed" => Ok(ActivityType::ExerciseCompleted),
            "quiz_taken" => Ok(ActivityType::QuizTaken),
            "code_executed" => Ok(ActivityType::CodeExecuted),
            other => Err(EngineError::InvalidInput(format!(
                "unknown activity type: {other}"
            ))),
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative bucket derived from a mastery score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryLevel {
    Beginner,
    Learning,
    Proficient,
    Mastered,
}

impl MasteryLevel {
    /// Buckets are closed on their upper bound so fractional scores such as
    /// 40.5 land in the next bucket up rather than falling through.
    pub fn from_score(score: f64) -> Self {
        if score <= 40.0 {
            MasteryLevel::Beginner
        } else if score <= 70.0 {
            MasteryLevel::Learning
        } else if score <= 90.0 {
            MasteryLevel::Proficient
        } else {
            MasteryLevel::Mastered
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MasteryLevel::Beginner => "beginner",
            MasteryLevel::Learning => "learning",
            MasteryLevel::Proficient => "proficient",
            MasteryLevel::Mastered => "mastered",
        }
    }
}

impl FromStr for MasteryLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beginner" => Ok(MasteryLevel::Beginner),
            "learning" => Ok(MasteryLevel::Learning),
            "proficient" => Ok(MasteryLevel::Proficient),
            "mastered" => Ok(MasteryLevel::Mastered),
            other => Err(EngineError::InvalidInput(format!(
                "unknown mastery level: {other}"
            ))),
        }
    }
}

impl fmt::Display for MasteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StruggleType {
    LowQuizScore,
    RepeatedFailures,
    RepeatedError,
    VerbalExpression,
}

impl StruggleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StruggleType::LowQuizScore => "low_quiz_score",
            StruggleType::RepeatedFailures => "repeated_failures",
            StruggleType::RepeatedError => "repeated_error",
            StruggleType::VerbalExpression => "verbal_expression",
        }
    }
}

impl FromStr for StruggleType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low_quiz_score" => Ok(StruggleType::LowQuizScore),
            "repeated_failures" => Ok(StruggleType::RepeatedFailures),
            "repeated_error" => Ok(StruggleType::RepeatedError),
            "verbal_expression" => Ok(StruggleType::VerbalExpression),
            other => Err(EngineError::InvalidInput(format!(
                "unknown struggle type: {other}"
            ))),
        }
    }
}

impl fmt::Display for StruggleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub module_id: String,
    pub module_name: String,
    pub exercise_score: f64,
    pub quiz_score: f64,
    pub code_quality: f64,
    pub streak_bonus: f64,
    pub mastery: f64,
    pub mastery_level: MasteryLevel,
    pub exercises_completed: u32,
    pub quizzes_taken: u32,
}

impl ModuleRecord {
    pub fn new(module: &Module) -> Self {
        Self {
            module_id: module.id.to_string(),
            module_name: module.name.to_string(),
            exercise_score: 0.0,
            quiz_score: 0.0,
            code_quality: 0.0,
            streak_bonus: 0.0,
            mastery: 0.0,
            mastery_level: MasteryLevel::Beginner,
            exercises_completed: 0,
            quizzes_taken: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerRecord {
    pub learner_id: String,
    pub modules: BTreeMap<String, ModuleRecord>,
    pub streak: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub total_exercises: u32,
    pub total_quizzes: u32,
}

impl LearnerRecord {
    /// Seeds one zeroed module record per curriculum module.
    pub fn new(learner_id: &str, modules: &[Module]) -> Self {
        Self {
            learner_id: learner_id.to_string(),
            modules: modules
                .iter()
                .map(|m| (m.id.to_string(), ModuleRecord::new(m)))
                .collect(),
            streak: 0,
            last_activity: None,
            total_exercises: 0,
            total_quizzes: 0,
        }
    }
}

/// One learning activity as accepted by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub learner_id: String,
    pub module_id: String,
    pub activity_type: ActivityType,
    pub score: f64,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MasteryUpdate {
    pub mastery: f64,
    pub mastery_level: MasteryLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StruggleAlert {
    pub id: Uuid,
    pub learner_id: String,
    pub struggle_type: StruggleType,
    pub module_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}

impl StruggleAlert {
    pub fn new(
        learner_id: &str,
        struggle_type: StruggleType,
        module_id: Option<&str>,
        details: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            learner_id: learner_id.to_string(),
            struggle_type,
            module_id: module_id.map(str::to_string),
            details,
            created_at,
            resolved: false,
        }
    }
}

/// Outbound payloads published to the event bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ProgressUpdated {
        user_id: String,
        module_id: String,
        mastery: f64,
        mastery_level: MasteryLevel,
    },
    StruggleDetected {
        struggle_type: StruggleType,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        module_id: Option<String>,
        details: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    pub fn topic(&self) -> &'static str {
        match self {
            Notification::ProgressUpdated { .. } => LEARNING_TOPIC,
            Notification::StruggleDetected { .. } => STRUGGLE_TOPIC,
        }
    }
}

impl From<&StruggleAlert> for Notification {
    fn from(alert: &StruggleAlert) -> Self {
        Notification::StruggleDetected {
            struggle_type: alert.struggle_type,
            user_id: alert.learner_id.clone(),
            module_id: alert.module_id.clone(),
            details: alert.details.clone(),
            timestamp: alert.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertTypeSummary {
    pub struggle_type: StruggleType,
    pub count: usize,
}
