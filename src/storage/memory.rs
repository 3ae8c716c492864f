use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::datasets::logs::{EventLogRecord, UserActionRecord};
use crate::models::errors::StorageError;
use crate::storage::{EventLogFilter, EventLogRepository, UserActionRepository};

/// Process-local store. Ids are UUIDv7, so key order is creation order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    event_logs: RwLock<BTreeMap<Uuid, EventLogRecord>>,
    user_actions: RwLock<BTreeMap<Uuid, (String, UserActionRecord)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLogRepository for MemoryStore {
    async fn create_event_log(&self, record: EventLogRecord) -> Result<(), StorageError> {
        let mut event_logs = self.event_logs.write().await;
        if event_logs.contains_key(&record.id) {
            return Err(StorageError::Duplicate { id: record.id });
        }
        event_logs.insert(record.id, record);
        Ok(())
    }

    async fn save_event_log(&self, record: EventLogRecord) -> Result<(), StorageError> {
        match self.event_logs.write().await.get_mut(&record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StorageError::NotFound { id: record.id }),
        }
    }

    async fn find_event_log(&self, id: Uuid) -> Result<EventLogRecord, StorageError> {
        self.event_logs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { id })
    }

    async fn event_log_exists(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(self.event_logs.read().await.contains_key(&id))
    }

    async fn query_event_logs(
        &self,
        filter: &EventLogFilter,
    ) -> Result<Vec<EventLogRecord>, StorageError> {
        Ok(self
            .event_logs
            .read()
            .await
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn count_event_logs(&self, filter: &EventLogFilter) -> Result<usize, StorageError> {
        Ok(self
            .event_logs
            .read()
            .await
            .values()
            .filter(|record| filter.matches(record))
            .count())
    }
}

#[async_trait]
impl UserActionRepository for MemoryStore {
    async fn create_user_action(
        &self,
        owner: &str,
        record: UserActionRecord,
    ) -> Result<(), StorageError> {
        let mut user_actions = self.user_actions.write().await;
        if user_actions.contains_key(&record.id) {
            return Err(StorageError::Duplicate { id: record.id });
        }
        user_actions.insert(record.id, (owner.to_string(), record));
        Ok(())
    }

    async fn find_user_action(&self, id: Uuid) -> Result<UserActionRecord, StorageError> {
        self.user_actions
            .read()
            .await
            .get(&id)
            .map(|(_, record)| record.clone())
            .ok_or(StorageError::NotFound { id })
    }

    async fn user_action_exists(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(self.user_actions.read().await.contains_key(&id))
    }

    async fn actions_for_owner(&self, owner: &str) -> Result<Vec<UserActionRecord>, StorageError> {
        Ok(self
            .user_actions
            .read()
            .await
            .values()
            .filter(|(key, _)| key == owner)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn actions_for_event_log(
        &self,
        event_log_id: Uuid,
    ) -> Result<Vec<UserActionRecord>, StorageError> {
        Ok(self
            .user_actions
            .read()
            .await
            .values()
            .filter(|(_, record)| record.event_log_id == event_log_id)
            .map(|(_, record)| record.clone())
            .collect())
    }
}
