use chrono::{DateTime, Utc};

use crate::curriculum;
use crate::error::EngineError;
use crate::models::{Activity, ActivityType, LearnerRecord, MasteryLevel, MasteryUpdate, ModuleRecord};
use crate::streak;

const EXERCISE_WEIGHT: f64 = 0.4;
const QUIZ_WEIGHT: f64 = 0.3;
const CODE_QUALITY_WEIGHT: f64 = 0.2;
const STREAK_WEIGHT: f64 = 0.1;

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn calculate_mastery(record: &ModuleRecord) -> f64 {
    round1(
        EXERCISE_WEIGHT * record.exercise_score
            + QUIZ_WEIGHT * record.quiz_score
            + CODE_QUALITY_WEIGHT * record.code_quality
            + STREAK_WEIGHT * record.streak_bonus,
    )
}

/// Incremental mean over `count` samples, where `count` already includes the new one.
pub fn running_mean(previous: f64, count: u32, sample: f64) -> f64 {
    let n = count.max(1) as f64;
    round1(((n - 1.0) * previous + sample) / n)
}

/// First measurement is adopted as-is; after that the new sample and the
/// current value are weighted equally.
pub fn blend_code_quality(current: f64, sample: f64) -> f64 {
    if current > 0.0 {
        round1((current + sample) / 2.0)
    } else {
        sample
    }
}

fn check_score(field: &str, value: f64) -> Result<f64, EngineError> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(EngineError::InvalidInput(format!(
            "{field} must be a number between 0 and 100, got {value}"
        )));
    }
    Ok(value)
}

/// Pulls `quality_score` out of an activity's details, if present.
pub fn quality_score(details: &serde_json::Value) -> Result<Option<f64>, EngineError> {
    match details.get("quality_score") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(number)) => {
            let value = number.as_f64().ok_or_else(|| {
                EngineError::InvalidInput("quality_score is not representable".into())
            })?;
            check_score("quality_score", value).map(Some)
        }
        Some(other) => Err(EngineError::InvalidInput(format!(
            "quality_score must be numeric, got {other}"
        ))),
    }
}

/// Folds one activity into the learner record.
///
/// All input is validated before the record is touched, so an error leaves
/// `learner` exactly as it was.
pub fn apply_activity(
    learner: &mut LearnerRecord,
    activity: &Activity,
    now: DateTime<Utc>,
) -> Result<MasteryUpdate, EngineError> {
    let module = curriculum::get_module(&activity.module_id)
        .ok_or_else(|| EngineError::ModuleNotFound(activity.module_id.clone()))?;
    let score = check_score("score", activity.score)?;
    let quality = quality_score(&activity.details)?;

    learner.streak = streak::advance_streak(learner.last_activity, now, learner.streak);
    learner.last_activity = Some(now);
    let bonus = streak::streak_bonus(learner.streak);

    let record = learner
        .modules
        .entry(module.id.to_string())
        .or_insert_with(|| ModuleRecord::new(module));

    match activity.activity_type {
        ActivityType::ExerciseCompleted => {
            record.exercises_completed += 1;
            learner.total_exercises += 1;
            record.exercise_score =
                running_mean(record.exercise_score, record.exercises_completed, score);
        }
        ActivityType::QuizTaken => {
            record.quizzes_taken += 1;
            learner.total_quizzes += 1;
            record.quiz_score = running_mean(record.quiz_score, record.quizzes_taken, score);
        }
        ActivityType::CodeExecuted => {
            if let Some(sample) = quality.filter(|q| *q > 0.0) {
                record.code_quality = blend_code_quality(record.code_quality, sample);
            }
        }
    }

    record.streak_bonus = bonus;
    record.mastery = calculate_mastery(record);
    record.mastery_level = MasteryLevel::from_score(record.mastery);

    Ok(MasteryUpdate {
        mastery: record.mastery,
        mastery_level: record.mastery_level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn activity(module_id: &str, activity_type: ActivityType, score: f64) -> Activity {
        Activity {
            learner_id: "user-1".to_string(),
            module_id: module_id.to_string(),
            activity_type,
            score,
            details: json!({}),
        }
    }

    fn code_run(quality: f64) -> Activity {
        Activity {
            details: json!({ "quality_score": quality }),
            ..activity("mod-1", ActivityType::CodeExecuted, 0.0)
        }
    }

    fn fresh() -> LearnerRecord {
        LearnerRecord::new("user-1", curriculum::list_modules())
    }

    #[test]
    fn exercise_score_is_mean_of_samples() {
        let mut learner = fresh();
        let now = Utc::now();
        let scores = [80.0, 60.0, 90.0, 70.0];
        for (i, score) in scores.iter().enumerate() {
            let at = now + Duration::minutes(i as i64);
            apply_activity(&mut learner, &activity("mod-1", ActivityType::ExerciseCompleted, *score), at)
                .unwrap();
        }
        let record = &learner.modules["mod-1"];
        assert_eq!(record.exercises_completed, 4);
        assert!((record.exercise_score - 75.0).abs() < 0.05);
        assert_eq!(learner.total_exercises, 4);
    }

    #[test]
    fn quiz_score_uses_its_own_count() {
        let mut learner = fresh();
        let now = Utc::now();
        apply_activity(&mut learner, &activity("mod-2", ActivityType::QuizTaken, 90.0), now).unwrap();
        apply_activity(&mut learner, &activity("mod-2", ActivityType::QuizTaken, 60.0), now).unwrap();
        let record = &learner.modules["mod-2"];
        assert_eq!(record.quizzes_taken, 2);
        assert_eq!(record.exercises_completed, 0);
        assert_eq!(record.quiz_score, 75.0);
        assert_eq!(learner.total_quizzes, 2);
    }

    #[test]
    fn first_exercise_computes_weighted_mastery() {
        let mut learner = fresh();
        let update = apply_activity(
            &mut learner,
            &activity("mod-1", ActivityType::ExerciseCompleted, 80.0),
            Utc::now(),
        )
        .unwrap();
        // 0.4 * 80 + 0.1 * 5
        assert_eq!(update.mastery, 32.5);
        assert_eq!(update.mastery_level, MasteryLevel::Beginner);
        assert_eq!(learner.streak, 1);
        assert_eq!(learner.modules["mod-1"].streak_bonus, 5.0);
    }

    #[test]
    fn code_quality_adopts_then_halves() {
        let mut learner = fresh();
        let now = Utc::now();
        apply_activity(&mut learner, &code_run(80.0), now).unwrap();
        assert_eq!(learner.modules["mod-1"].code_quality, 80.0);
        apply_activity(&mut learner, &code_run(60.0), now).unwrap();
        assert_eq!(learner.modules["mod-1"].code_quality, 70.0);
        apply_activity(&mut learner, &code_run(90.0), now).unwrap();
        // Not a running mean over (80, 60, 90).
        assert_eq!(learner.modules["mod-1"].code_quality, 80.0);
    }

    #[test]
    fn code_run_without_quality_leaves_score() {
        let mut learner = fresh();
        let now = Utc::now();
        apply_activity(&mut learner, &code_run(50.0), now).unwrap();
        apply_activity(&mut learner, &code_run(0.0), now).unwrap();
        apply_activity(&mut learner, &activity("mod-1", ActivityType::CodeExecuted, 0.0), now)
            .unwrap();
        assert_eq!(learner.modules["mod-1"].code_quality, 50.0);
    }

    #[test]
    fn unknown_module_is_rejected_without_mutation() {
        let mut learner = fresh();
        let before = learner.clone();
        let err = apply_activity(
            &mut learner,
            &activity("mod-99", ActivityType::ExerciseCompleted, 80.0),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ModuleNotFound(id) if id == "mod-99"));
        assert_eq!(learner, before);
    }

    #[test]
    fn malformed_scores_are_rejected_without_mutation() {
        let mut learner = fresh();
        let before = learner.clone();
        let now = Utc::now();

        let nan = activity("mod-1", ActivityType::ExerciseCompleted, f64::NAN);
        assert!(matches!(
            apply_activity(&mut learner, &nan, now),
            Err(EngineError::InvalidInput(_))
        ));

        let too_high = activity("mod-1", ActivityType::QuizTaken, 140.0);
        assert!(apply_activity(&mut learner, &too_high, now).is_err());

        let text_quality = Activity {
            details: json!({ "quality_score": "great" }),
            ..activity("mod-1", ActivityType::CodeExecuted, 0.0)
        };
        assert!(apply_activity(&mut learner, &text_quality, now).is_err());

        assert_eq!(learner, before);
    }

    #[test]
    fn mastery_stays_within_level_range() {
        let mut learner = fresh();
        let now = Utc::now();
        for i in 0..30 {
            let at = now + Duration::hours(i);
            apply_activity(&mut learner, &activity("mod-4", ActivityType::ExerciseCompleted, 100.0), at)
                .unwrap();
            apply_activity(&mut learner, &activity("mod-4", ActivityType::QuizTaken, 100.0), at)
                .unwrap();
            apply_activity(&mut learner, &Activity { module_id: "mod-4".into(), ..code_run(100.0) }, at)
                .unwrap();
            let record = &learner.modules["mod-4"];
            assert!((0.0..=100.0).contains(&record.mastery));
            assert_eq!(record.mastery_level, MasteryLevel::from_score(record.mastery));
        }
        assert_eq!(learner.modules["mod-4"].mastery, 100.0);
        assert_eq!(learner.modules["mod-4"].mastery_level, MasteryLevel::Mastered);
    }

    #[test]
    fn running_mean_handles_first_sample() {
        assert_eq!(running_mean(0.0, 1, 42.0), 42.0);
        assert_eq!(running_mean(42.0, 2, 58.0), 50.0);
    }
}
