//! Storage for learner progress and struggle alerts

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::models::{LearnerRecord, StruggleAlert};

/// Keyed learner state plus the append-only alert log.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load_learner(&self, learner_id: &str) -> Result<Option<LearnerRecord>, EngineError>;

    /// Replace the stored record for `record.learner_id` in one step.
    async fn save_learner(&self, record: &LearnerRecord) -> Result<(), EngineError>;

    /// Load, transform and save one learner as a single atomic step.
    ///
    /// `apply` receives the stored record (`None` for a new learner) and
    /// returns the record to save. No other update to the same learner may
    /// interleave, including one from another process sharing the backend.
    /// An `apply` error leaves the stored record untouched.
    async fn update_learner(
        &self,
        learner_id: &str,
        apply: &mut (dyn FnMut(Option<LearnerRecord>) -> Result<LearnerRecord, EngineError> + Send),
    ) -> Result<LearnerRecord, EngineError> {
        let record = apply(self.load_learner(learner_id).await?)?;
        self.save_learner(&record).await?;
        Ok(record)
    }

    async fn append_alert(&self, alert: &StruggleAlert) -> Result<(), EngineError>;

    /// Unresolved alerts, oldest first, optionally for a single learner
    async fn open_alerts(&self, learner_id: Option<&str>)
        -> Result<Vec<StruggleAlert>, EngineError>;

    async fn learner_ids(&self) -> Result<Vec<String>, EngineError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    learners: RwLock<HashMap<String, LearnerRecord>>,
    alerts: RwLock<Vec<StruggleAlert>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn load_learner(&self, learner_id: &str) -> Result<Option<LearnerRecord>, EngineError> {
        Ok(self.learners.read().await.get(learner_id).cloned())
    }

    async fn save_learner(&self, record: &LearnerRecord) -> Result<(), EngineError> {
        self.learners
            .write()
            .await
            .insert(record.learner_id.clone(), record.clone());
        Ok(())
    }

    async fn update_learner(
        &self,
        learner_id: &str,
        apply: &mut (dyn FnMut(Option<LearnerRecord>) -> Result<LearnerRecord, EngineError> + Send),
    ) -> Result<LearnerRecord, EngineError> {
        let mut learners = self.learners.write().await;
        let record = apply(learners.get(learner_id).cloned())?;
        learners.insert(learner_id.to_string(), record.clone());
        Ok(record)
    }

    async fn append_alert(&self, alert: &StruggleAlert) -> Result<(), EngineError> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }

    async fn open_alerts(
        &self,
        learner_id: Option<&str>,
    ) -> Result<Vec<StruggleAlert>, EngineError> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .filter(|alert| !alert.resolved)
            .filter(|alert| learner_id.map_or(true, |id| alert.learner_id == id))
            .cloned()
            .collect())
    }

    async fn learner_ids(&self) -> Result<Vec<String>, EngineError> {
        let mut ids: Vec<String> = self.learners.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
