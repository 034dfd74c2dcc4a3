use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::curriculum;
use crate::error::EngineError;
use crate::mastery;
use crate::models::{
    Activity, ActivityType, LearnerRecord, MasteryUpdate, ModuleRecord, Notification,
    StruggleAlert,
};
use crate::publish::Publisher;
use crate::store::ProgressStore;
use crate::struggle::{self, StruggleDetector};

/// Applies learning activity to per-learner progress and raises struggle alerts.
///
/// Mutations for one learner are serialized behind that learner's lock, and
/// the store applies each one atomically so engines in other processes
/// sharing the backend cannot interleave. Different learners never wait on
/// each other. Notifications go out only after the lock is released.
pub struct Engine {
    store: Arc<dyn ProgressStore>,
    publisher: Arc<dyn Publisher>,
    detector: StruggleDetector,
    learner_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn ProgressStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            publisher,
            detector: StruggleDetector::new(),
            learner_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn publisher(&self) -> &dyn Publisher {
        self.publisher.as_ref()
    }

    fn learner_lock(&self, learner_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .learner_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(learner_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn stored_or_new(stored: Option<LearnerRecord>, learner_id: &str) -> LearnerRecord {
        stored.unwrap_or_else(|| {
            debug!(learner_id, "initializing learner progress");
            LearnerRecord::new(learner_id, curriculum::list_modules())
        })
    }

    pub async fn record_activity(&self, activity: &Activity) -> Result<MasteryUpdate, EngineError> {
        self.record_activity_at(activity, Utc::now()).await
    }

    /// Same as [`Engine::record_activity`] with an explicit clock, used when
    /// replaying historical activity.
    pub async fn record_activity_at(
        &self,
        activity: &Activity,
        now: DateTime<Utc>,
    ) -> Result<MasteryUpdate, EngineError> {
        if activity.learner_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("learner id is empty".into()));
        }

        let update = {
            let lock = self.learner_lock(&activity.learner_id);
            let _guard = lock.lock().await;

            let mut update = None;
            let mut apply = |stored: Option<LearnerRecord>| -> Result<LearnerRecord, EngineError> {
                let mut learner = Self::stored_or_new(stored, &activity.learner_id);
                update = Some(mastery::apply_activity(&mut learner, activity, now)?);
                Ok(learner)
            };
            self.store
                .update_learner(&activity.learner_id, &mut apply)
                .await?;
            update.ok_or_else(|| EngineError::Store("learner update was not applied".into()))?
        };

        debug!(
            learner_id = %activity.learner_id,
            module_id = %activity.module_id,
            activity = %activity.activity_type,
            mastery = update.mastery,
            level = %update.mastery_level,
            "activity recorded"
        );

        if activity.activity_type == ActivityType::QuizTaken {
            if let Some(alert) =
                struggle::check_quiz(&activity.learner_id, &activity.module_id, activity.score, now)
            {
                self.raise(alert).await;
            }
        }

        self.publisher.publish(Notification::ProgressUpdated {
            user_id: activity.learner_id.clone(),
            module_id: activity.module_id.clone(),
            mastery: update.mastery,
            mastery_level: update.mastery_level,
        });

        Ok(update)
    }

    /// Feeds a code-execution status into the consecutive-failure rule.
    pub async fn record_execution(
        &self,
        learner_id: &str,
        module_id: Option<&str>,
        status: &str,
    ) -> Option<StruggleAlert> {
        let alert = self
            .detector
            .record_execution(learner_id, module_id, status, Utc::now())?;
        self.raise(alert.clone()).await;
        Some(alert)
    }

    /// Feeds one analysed error into the repeated-error rule.
    pub async fn record_error(&self, learner_id: &str, error_type: &str) -> Option<StruggleAlert> {
        let alert = self.detector.record_error(learner_id, error_type, Utc::now())?;
        self.raise(alert.clone()).await;
        Some(alert)
    }

    pub async fn check_question(&self, learner_id: &str, question: &str) -> Option<StruggleAlert> {
        let alert = struggle::check_question(learner_id, question, Utc::now())?;
        self.raise(alert.clone()).await;
        Some(alert)
    }

    /// Alerts are best-effort: a failed append or publish is logged and dropped.
    async fn raise(&self, alert: StruggleAlert) {
        info!(
            learner_id = %alert.learner_id,
            struggle_type = %alert.struggle_type,
            module_id = alert.module_id.as_deref().unwrap_or("-"),
            "struggle detected"
        );

        if let Err(err) = self.store.append_alert(&alert).await {
            warn!(alert_id = %alert.id, error = %err, "failed to store struggle alert");
        }
        self.publisher.publish(Notification::from(&alert));
    }

    /// Current progress, creating the learner on first reference.
    pub async fn progress(&self, learner_id: &str) -> Result<LearnerRecord, EngineError> {
        let lock = self.learner_lock(learner_id);
        let _guard = lock.lock().await;

        if let Some(record) = self.store.load_learner(learner_id).await? {
            return Ok(record);
        }
        let mut create = |stored: Option<LearnerRecord>| -> Result<LearnerRecord, EngineError> {
            Ok(Self::stored_or_new(stored, learner_id))
        };
        self.store.update_learner(learner_id, &mut create).await
    }

    pub async fn module_mastery(
        &self,
        learner_id: &str,
        module_id: &str,
    ) -> Result<ModuleRecord, EngineError> {
        let module = curriculum::get_module(module_id)
            .ok_or_else(|| EngineError::ModuleNotFound(module_id.to_string()))?;
        let mut progress = self.progress(learner_id).await?;
        Ok(progress
            .modules
            .remove(module.id)
            .unwrap_or_else(|| ModuleRecord::new(module)))
    }

    pub async fn open_alerts(
        &self,
        learner_id: Option<&str>,
    ) -> Result<Vec<StruggleAlert>, EngineError> {
        self.store.open_alerts(learner_id).await
    }

    pub async fn learner_ids(&self) -> Result<Vec<String>, EngineError> {
        self.store.learner_ids().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MasteryLevel, StruggleType};
    use crate::publish::testing::RecordingPublisher;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;

    fn engine() -> (Engine, Arc<MemoryStore>, Arc<RecordingPublisher>) {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        (Engine::new(store.clone(), publisher.clone()), store, publisher)
    }

    fn activity(learner: &str, module: &str, activity_type: ActivityType, score: f64) -> Activity {
        Activity {
            learner_id: learner.to_string(),
            module_id: module.to_string(),
            activity_type,
            score,
            details: json!({}),
        }
    }

    /// Yields between load and save so concurrent callers interleave if unserialized.
    struct SlowStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ProgressStore for SlowStore {
        async fn load_learner(&self, learner_id: &str) -> Result<Option<LearnerRecord>, EngineError> {
            let record = self.inner.load_learner(learner_id).await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            record
        }

        async fn save_learner(&self, record: &LearnerRecord) -> Result<(), EngineError> {
            tokio::task::yield_now().await;
            self.inner.save_learner(record).await
        }

        async fn append_alert(&self, alert: &StruggleAlert) -> Result<(), EngineError> {
            self.inner.append_alert(alert).await
        }

        async fn open_alerts(
            &self,
            learner_id: Option<&str>,
        ) -> Result<Vec<StruggleAlert>, EngineError> {
            self.inner.open_alerts(learner_id).await
        }

        async fn learner_ids(&self) -> Result<Vec<String>, EngineError> {
            self.inner.learner_ids().await
        }
    }

    /// Loads fine but refuses every write.
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ProgressStore for ReadOnlyStore {
        async fn load_learner(&self, learner_id: &str) -> Result<Option<LearnerRecord>, EngineError> {
            self.inner.load_learner(learner_id).await
        }

        async fn save_learner(&self, _record: &LearnerRecord) -> Result<(), EngineError> {
            Err(EngineError::Store("read only".into()))
        }

        async fn append_alert(&self, _alert: &StruggleAlert) -> Result<(), EngineError> {
            Err(EngineError::Store("read only".into()))
        }

        async fn open_alerts(
            &self,
            learner_id: Option<&str>,
        ) -> Result<Vec<StruggleAlert>, EngineError> {
            self.inner.open_alerts(learner_id).await
        }

        async fn learner_ids(&self) -> Result<Vec<String>, EngineError> {
            self.inner.learner_ids().await
        }
    }

    #[tokio::test]
    async fn record_activity_updates_and_publishes() {
        let (engine, store, publisher) = engine();
        let update = engine
            .record_activity(&activity("user-1", "mod-1", ActivityType::ExerciseCompleted, 80.0))
            .await
            .unwrap();
        assert_eq!(update.mastery, 32.5);
        assert_eq!(update.mastery_level, MasteryLevel::Beginner);

        let stored = store.load_learner("user-1").await.unwrap().unwrap();
        assert_eq!(stored.modules.len(), 8);
        assert_eq!(stored.modules["mod-1"].exercises_completed, 1);
        assert_eq!(stored.total_exercises, 1);

        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            Notification::ProgressUpdated {
                user_id: "user-1".into(),
                module_id: "mod-1".into(),
                mastery: 32.5,
                mastery_level: MasteryLevel::Beginner,
            }
        );
    }

    #[tokio::test]
    async fn unknown_module_does_not_create_or_publish() {
        let (engine, store, publisher) = engine();
        let err = engine
            .record_activity(&activity("user-1", "mod-99", ActivityType::QuizTaken, 20.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ModuleNotFound(_)));
        assert!(store.load_learner("user-1").await.unwrap().is_none());
        assert!(publisher.sent().is_empty());
        assert!(engine.open_alerts(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn low_quiz_alerts_every_time() {
        let (engine, _, publisher) = engine();
        for _ in 0..3 {
            engine
                .record_activity(&activity("user-1", "mod-1", ActivityType::QuizTaken, 30.0))
                .await
                .unwrap();
        }
        let alerts = engine.open_alerts(Some("user-1")).await.unwrap();
        assert_eq!(alerts.len(), 3);
        assert!(alerts
            .iter()
            .all(|alert| alert.struggle_type == StruggleType::LowQuizScore));

        let struggles = publisher
            .sent()
            .into_iter()
            .filter(|note| matches!(note, Notification::StruggleDetected { .. }))
            .count();
        assert_eq!(struggles, 3);
    }

    #[tokio::test]
    async fn passing_quiz_raises_nothing() {
        let (engine, _, _) = engine();
        engine
            .record_activity(&activity("user-1", "mod-1", ActivityType::QuizTaken, 50.0))
            .await
            .unwrap();
        assert!(engine.open_alerts(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn streak_follows_activity_gaps() {
        let (engine, _, _) = engine();
        let start = Utc::now();
        let exercise = activity("user-1", "mod-1", ActivityType::ExerciseCompleted, 70.0);

        engine.record_activity_at(&exercise, start).await.unwrap();
        assert_eq!(engine.progress("user-1").await.unwrap().streak, 1);

        engine
            .record_activity_at(&exercise, start + Duration::hours(10))
            .await
            .unwrap();
        let progress = engine.progress("user-1").await.unwrap();
        assert_eq!(progress.streak, 2);
        assert_eq!(progress.modules["mod-1"].streak_bonus, 10.0);

        engine
            .record_activity_at(&exercise, start + Duration::hours(60))
            .await
            .unwrap();
        let progress = engine.progress("user-1").await.unwrap();
        assert_eq!(progress.streak, 1);
        assert_eq!(progress.last_activity, Some(start + Duration::hours(60)));
    }

    #[tokio::test]
    async fn five_failures_raise_one_alert() {
        let (engine, _, _) = engine();
        let mut fired = 0;
        for _ in 0..6 {
            if engine.record_execution("user-1", Some("mod-2"), "error").await.is_some() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        let alerts = engine.open_alerts(Some("user-1")).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].struggle_type, StruggleType::RepeatedFailures);
        assert_eq!(alerts[0].module_id.as_deref(), Some("mod-2"));
        assert_eq!(engine.detector.consecutive_failures("user-1"), 1);
    }

    #[tokio::test]
    async fn distress_question_raises_one_alert() {
        let (engine, _, _) = engine();
        assert!(engine
            .check_question("user-1", "I'm stuck on this loop")
            .await
            .is_some());
        assert!(engine
            .check_question("user-1", "What does enumerate return?")
            .await
            .is_none());
        let alerts = engine.open_alerts(Some("user-1")).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].struggle_type, StruggleType::VerbalExpression);
    }

    #[tokio::test]
    async fn progress_creates_learner_on_first_use() {
        let (engine, store, _) = engine();
        let progress = engine.progress("user-1").await.unwrap();
        assert_eq!(progress.modules.len(), 8);
        assert!(progress
            .modules
            .values()
            .all(|module| module.mastery == 0.0 && module.mastery_level == MasteryLevel::Beginner));
        assert!(store.load_learner("user-1").await.unwrap().is_some());

        let module = engine.module_mastery("user-1", "mod-1").await.unwrap();
        assert_eq!(module.module_id, "mod-1");
        assert!(matches!(
            engine.module_mastery("user-1", "mod-99").await,
            Err(EngineError::ModuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_save_leaves_state_untouched() {
        let inner = MemoryStore::new();
        let seeded = LearnerRecord::new("user-1", curriculum::list_modules());
        inner.save_learner(&seeded).await.unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let store = Arc::new(ReadOnlyStore { inner });
        let engine = Engine::new(store.clone(), publisher.clone());

        let result = engine
            .record_activity(&activity("user-1", "mod-1", ActivityType::QuizTaken, 10.0))
            .await;
        assert!(matches!(result, Err(EngineError::Store(_))));
        assert_eq!(store.load_learner("user-1").await.unwrap().unwrap(), seeded);
        assert!(publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn alert_store_failure_is_swallowed() {
        let publisher = Arc::new(RecordingPublisher::default());
        let store = Arc::new(ReadOnlyStore {
            inner: MemoryStore::new(),
        });
        let engine = Engine::new(store, publisher.clone());

        let alert = engine.check_question("user-1", "this is too hard").await;
        assert!(alert.is_some());
        assert_eq!(publisher.sent().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_for_one_learner_are_serialized() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
        });
        let engine = Arc::new(Engine::new(store.clone(), Arc::new(RecordingPublisher::default())));
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .record_activity_at(
                        &activity("user-1", "mod-3", ActivityType::ExerciseCompleted, 60.0),
                        now,
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = store.load_learner("user-1").await.unwrap().unwrap();
        assert_eq!(record.modules["mod-3"].exercises_completed, 20);
        assert_eq!(record.total_exercises, 20);
        assert_eq!(record.streak, 20);
        assert_eq!(record.modules["mod-3"].exercise_score, 60.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn learners_do_not_block_each_other() {
        let (engine, store, _) = engine();
        let lock = engine.learner_lock("user-1");
        let _held = lock.lock().await;

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            engine.record_activity(&activity("user-2", "mod-1", ActivityType::ExerciseCompleted, 90.0)),
        )
        .await;
        assert!(result.is_ok(), "user-2 waited on user-1's lock");

        let other = store.load_learner("user-2").await.unwrap().unwrap();
        assert_eq!(other.modules["mod-1"].exercise_score, 90.0);
        assert!(store.load_learner("user-1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engines_sharing_a_store_do_not_lose_updates() {
        let store = Arc::new(MemoryStore::new());
        let engines: Vec<Arc<Engine>> = (0..2)
            .map(|_| {
                Arc::new(Engine::new(
                    store.clone(),
                    Arc::new(RecordingPublisher::default()),
                ))
            })
            .collect();
        let now = Utc::now();

        let mut handles = Vec::new();
        for round in 0..20 {
            let engine = engines[round % 2].clone();
            handles.push(tokio::spawn(async move {
                engine
                    .record_activity_at(
                        &activity("user-1", "mod-1", ActivityType::ExerciseCompleted, 80.0),
                        now,
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = store.load_learner("user-1").await.unwrap().unwrap();
        assert_eq!(record.modules["mod-1"].exercises_completed, 20);
        assert_eq!(record.total_exercises, 20);
    }

    #[tokio::test]
    async fn sequential_calls_apply_in_order() {
        let (engine, _, _) = engine();
        let now = Utc::now();
        engine
            .record_activity_at(&activity("user-1", "mod-1", ActivityType::QuizTaken, 100.0), now)
            .await
            .unwrap();
        engine
            .record_activity_at(
                &activity("user-1", "mod-1", ActivityType::QuizTaken, 40.0),
                now + Duration::minutes(5),
            )
            .await
            .unwrap();
        let module = engine.module_mastery("user-1", "mod-1").await.unwrap();
        assert_eq!(module.quizzes_taken, 2);
        assert_eq!(module.quiz_score, 70.0);
    }
}
