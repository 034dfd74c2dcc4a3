use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::curriculum;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::models::{Activity, ActivityType};

#[derive(Debug, Deserialize)]
struct CsvRow {
    learner_id: String,
    module_id: Option<String>,
    activity_type: String,
    score: Option<f64>,
    quality_score: Option<f64>,
    occurred_at: Option<DateTime<Utc>>,
}

impl CsvRow {
    fn into_activity(self) -> Result<(Activity, Option<DateTime<Utc>>), EngineError> {
        let activity_type: ActivityType = self.activity_type.trim().parse()?;
        let details = match self.quality_score {
            Some(quality) => json!({ "quality_score": quality }),
            None => json!({}),
        };
        let module_id = self
            .module_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| curriculum::first_module().id.to_string());

        Ok((
            Activity {
                learner_id: self.learner_id,
                module_id,
                activity_type,
                score: self.score.unwrap_or(0.0),
                details,
            },
            self.occurred_at,
        ))
    }
}

/// Replays activity rows through the engine in file order.
///
/// Malformed rows and rows the engine rejects (unknown module, bad score)
/// are logged and skipped; a read or store failure aborts the import.
pub async fn import_csv(engine: &Engine, csv_path: &Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut recorded = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(err) if is_malformed_row(&err) => {
                warn!(row = line + 1, error = %err, "skipping malformed row");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let outcome = match row.into_activity() {
            Ok((activity, Some(at))) => engine.record_activity_at(&activity, at).await,
            Ok((activity, None)) => engine.record_activity(&activity).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(_) => recorded += 1,
            Err(err @ (EngineError::ModuleNotFound(_) | EngineError::InvalidInput(_))) => {
                warn!(row = line + 1, error = %err, "skipping activity row");
            }
            Err(err) => return Err(err.into()),
        }
    }

    info!(recorded, path = %csv_path.display(), "activity import finished");
    Ok(recorded)
}

fn is_malformed_row(err: &csv::Error) -> bool {
    matches!(
        err.kind(),
        csv::ErrorKind::Deserialize { .. } | csv::ErrorKind::UnequalLengths { .. }
    )
}

/// Replays a short scripted history for three demo learners.
pub async fn seed(engine: &Engine) -> anyhow::Result<usize> {
    let now = Utc::now();
    let script: Vec<(&str, &str, ActivityType, f64, Option<f64>, i64)> = vec![
        ("avery.lee", "mod-1", ActivityType::ExerciseCompleted, 92.0, None, 72),
        ("avery.lee", "mod-1", ActivityType::QuizTaken, 88.0, None, 60),
        ("avery.lee", "mod-1", ActivityType::CodeExecuted, 0.0, Some(85.0), 50),
        ("avery.lee", "mod-2", ActivityType::ExerciseCompleted, 78.0, None, 30),
        ("avery.lee", "mod-2", ActivityType::QuizTaken, 81.0, None, 8),
        ("jules.moreno", "mod-1", ActivityType::ExerciseCompleted, 64.0, None, 120),
        ("jules.moreno", "mod-1", ActivityType::QuizTaken, 42.0, None, 20),
        ("jules.moreno", "mod-1", ActivityType::QuizTaken, 38.0, None, 2),
        ("kiara.patel", "mod-3", ActivityType::ExerciseCompleted, 70.0, None, 6),
        ("kiara.patel", "mod-3", ActivityType::CodeExecuted, 0.0, Some(60.0), 4),
        ("kiara.patel", "mod-3", ActivityType::CodeExecuted, 0.0, Some(74.0), 1),
    ];

    let mut recorded = 0usize;
    for (learner, module, activity_type, score, quality, hours_ago) in script {
        let details = match quality {
            Some(quality) => json!({ "quality_score": quality }),
            None => json!({}),
        };
        let activity = Activity {
            learner_id: learner.to_string(),
            module_id: module.to_string(),
            activity_type,
            score,
            details,
        };
        engine
            .record_activity_at(&activity, now - Duration::hours(hours_ago))
            .await?;
        recorded += 1;
    }

    for _ in 0..5 {
        engine.record_execution("kiara.patel", Some("mod-3"), "error").await;
    }
    engine
        .check_question("jules.moreno", "I don't understand why my loop never ends")
        .await;

    Ok(recorded)
}
