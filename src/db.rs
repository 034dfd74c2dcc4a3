use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{LearnerRecord, ModuleRecord, StruggleAlert};
use crate::store::ProgressStore;

const LEARNER_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

pub async fn init_db(pool: &PgPool) -> Result<(), EngineError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn to_db_count(field: &str, value: u32) -> Result<i32, EngineError> {
    i32::try_from(value)
        .map_err(|_| EngineError::Store(format!("{field} {value} exceeds column range")))
}

fn from_db_count(row: &PgRow, field: &str) -> Result<u32, EngineError> {
    let value: i32 = row.try_get(field)?;
    u32::try_from(value)
        .map_err(|_| EngineError::Store(format!("{field} is negative in stored row: {value}")))
}

fn module_from_row(row: &PgRow) -> Result<ModuleRecord, EngineError> {
    let level: String = row.try_get("mastery_level")?;
    Ok(ModuleRecord {
        module_id: row.try_get("module_id")?,
        module_name: row.try_get("module_name")?,
        exercise_score: row.try_get("exercise_score")?,
        quiz_score: row.try_get("quiz_score")?,
        code_quality: row.try_get("code_quality")?,
        streak_bonus: row.try_get("streak_bonus")?,
        mastery: row.try_get("mastery")?,
        mastery_level: level.parse()?,
        exercises_completed: from_db_count(row, "exercises_completed")?,
        quizzes_taken: from_db_count(row, "quizzes_taken")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<StruggleAlert, EngineError> {
    let struggle_type: String = row.try_get("struggle_type")?;
    let details: Json<serde_json::Value> = row.try_get("details")?;
    Ok(StruggleAlert {
        id: row.try_get::<Uuid, _>("id")?,
        learner_id: row.try_get("learner_id")?,
        struggle_type: struggle_type.parse()?,
        module_id: row.try_get("module_id")?,
        details: details.0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        resolved: row.try_get("resolved")?,
    })
}

async fn fetch_learner(
    conn: &mut PgConnection,
    learner_id: &str,
) -> Result<Option<LearnerRecord>, EngineError> {
    let Some(row) = sqlx::query(
        r#"
        SELECT learner_id, streak, last_activity, total_exercises, total_quizzes
        FROM learning_progress.learners
        WHERE learner_id = $1
        "#,
    )
    .bind(learner_id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let module_rows = sqlx::query(
        r#"
        SELECT module_id, module_name, exercise_score, quiz_score, code_quality,
               streak_bonus, mastery, mastery_level, exercises_completed, quizzes_taken
        FROM learning_progress.learner_modules
        WHERE learner_id = $1
        "#,
    )
    .bind(learner_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut modules = BTreeMap::new();
    for module_row in module_rows.iter() {
        let record = module_from_row(module_row)?;
        modules.insert(record.module_id.clone(), record);
    }

    Ok(Some(LearnerRecord {
        learner_id: row.try_get("learner_id")?,
        modules,
        streak: from_db_count(&row, "streak")?,
        last_activity: row.try_get("last_activity")?,
        total_exercises: from_db_count(&row, "total_exercises")?,
        total_quizzes: from_db_count(&row, "total_quizzes")?,
    }))
}

async fn write_learner(conn: &mut PgConnection, record: &LearnerRecord) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO learning_progress.learners
        (learner_id, streak, last_activity, total_exercises, total_quizzes, updated_at)
        VALUES ($1, $2, $3, $4, $5, now())
        ON CONFLICT (learner_id) DO UPDATE
        SET streak = EXCLUDED.streak,
            last_activity = EXCLUDED.last_activity,
            total_exercises = EXCLUDED.total_exercises,
            total_quizzes = EXCLUDED.total_quizzes,
            updated_at = now()
        "#,
    )
    .bind(&record.learner_id)
    .bind(to_db_count("streak", record.streak)?)
    .bind(record.last_activity)
    .bind(to_db_count("total_exercises", record.total_exercises)?)
    .bind(to_db_count("total_quizzes", record.total_quizzes)?)
    .execute(&mut *conn)
    .await?;

    for module in record.modules.values() {
        sqlx::query(
            r#"
            INSERT INTO learning_progress.learner_modules
            (learner_id, module_id, module_name, exercise_score, quiz_score, code_quality,
             streak_bonus, mastery, mastery_level, exercises_completed, quizzes_taken)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (learner_id, module_id) DO UPDATE
            SET module_name = EXCLUDED.module_name,
                exercise_score = EXCLUDED.exercise_score,
                quiz_score = EXCLUDED.quiz_score,
                code_quality = EXCLUDED.code_quality,
                streak_bonus = EXCLUDED.streak_bonus,
                mastery = EXCLUDED.mastery,
                mastery_level = EXCLUDED.mastery_level,
                exercises_completed = EXCLUDED.exercises_completed,
                quizzes_taken = EXCLUDED.quizzes_taken
            "#,
        )
        .bind(&record.learner_id)
        .bind(&module.module_id)
        .bind(&module.module_name)
        .bind(module.exercise_score)
        .bind(module.quiz_score)
        .bind(module.code_quality)
        .bind(module.streak_bonus)
        .bind(module.mastery)
        .bind(module.mastery_level.as_str())
        .bind(to_db_count("exercises_completed", module.exercises_completed)?)
        .bind(to_db_count("quizzes_taken", module.quizzes_taken)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Postgres-backed progress store. Each learner save runs in one transaction;
/// updates for one learner are serialized across processes by a
/// transaction-scoped advisory lock keyed on the learner id.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn load_learner(&self, learner_id: &str) -> Result<Option<LearnerRecord>, EngineError> {
        let mut conn = self.pool.acquire().await?;
        fetch_learner(&mut *conn, learner_id).await
    }

    async fn save_learner(&self, record: &LearnerRecord) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        write_learner(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_learner(
        &self,
        learner_id: &str,
        apply: &mut (dyn FnMut(Option<LearnerRecord>) -> Result<LearnerRecord, EngineError> + Send),
    ) -> Result<LearnerRecord, EngineError> {
        let mut tx = self.pool.begin().await?;
        // Held until commit or rollback.
        sqlx::query(LEARNER_LOCK_SQL)
            .bind(learner_id)
            .execute(&mut *tx)
            .await?;

        let stored = fetch_learner(&mut *tx, learner_id).await?;
        let record = apply(stored)?;
        write_learner(&mut *tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn append_alert(&self, alert: &StruggleAlert) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO learning_progress.struggle_alerts
            (id, learner_id, struggle_type, module_id, details, created_at, resolved)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(alert.id)
        .bind(&alert.learner_id)
        .bind(alert.struggle_type.as_str())
        .bind(alert.module_id.as_deref())
        .bind(Json(&alert.details))
        .bind(alert.created_at)
        .bind(alert.resolved)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_alerts(
        &self,
        learner_id: Option<&str>,
    ) -> Result<Vec<StruggleAlert>, EngineError> {
        let mut query = String::from(
            "SELECT id, learner_id, struggle_type, module_id, details, created_at, resolved \
             FROM learning_progress.struggle_alerts \
             WHERE NOT resolved",
        );
        if learner_id.is_some() {
            query.push_str(" AND learner_id = $1");
        }
        query.push_str(" ORDER BY created_at");

        let mut rows = sqlx::query(&query);
        if let Some(value) = learner_id {
            rows = rows.bind(value);
        }

        let records = rows.fetch_all(&self.pool).await?;
        let mut alerts = Vec::with_capacity(records.len());
        for row in records.iter() {
            alerts.push(alert_from_row(row)?);
        }
        Ok(alerts)
    }

    async fn learner_ids(&self) -> Result<Vec<String>, EngineError> {
        let rows = sqlx::query("SELECT learner_id FROM learning_progress.learners ORDER BY learner_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("learner_id").map_err(EngineError::from))
            .collect()
    }
}
