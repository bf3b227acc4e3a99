//! Persistence boundary for samples, statuses and sessions.

use crate::{
    error::Result,
    types::{Session, TrainingStatus, TreadmillSample},
};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};
use tokio::sync::RwLock;

/// Append-only history store
///
/// Samples and statuses are keyed by their timestamp; writing the same
/// timestamp twice replaces the earlier record. Sessions get an increasing id.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Record a telemetry sample
    async fn append_sample(&self, sample: &TreadmillSample) -> Result<()>;

    /// Record a training status transition
    async fn append_status(&self, status: &TrainingStatus) -> Result<()>;

    /// Record a completed session and return its id
    async fn append_session(&self, session: &Session) -> Result<u64>;

    /// Samples with `start <= timestamp <= end`, oldest first
    async fn samples_between(
        &self,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<Vec<TreadmillSample>>;
}

/// In-memory [`SampleStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    samples: RwLock<BTreeMap<SystemTime, TreadmillSample>>,
    statuses: RwLock<BTreeMap<SystemTime, TrainingStatus>>,
    sessions: RwLock<BTreeMap<u64, Session>>,
    next_session_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored samples
    pub async fn sample_count(&self) -> usize {
        self.samples.read().await.len()
    }

    /// Stored statuses, oldest first
    pub async fn statuses(&self) -> Vec<TrainingStatus> {
        self.statuses.read().await.values().cloned().collect()
    }

    /// Stored sessions in id order
    pub async fn sessions(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn append_sample(&self, sample: &TreadmillSample) -> Result<()> {
        self.samples
            .write()
            .await
            .insert(sample.timestamp, sample.clone());
        Ok(())
    }

    async fn append_status(&self, status: &TrainingStatus) -> Result<()> {
        self.statuses
            .write()
            .await
            .insert(status.timestamp, status.clone());
        Ok(())
    }

    async fn append_session(&self, session: &Session) -> Result<u64> {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = session.clone();
        stored.id = Some(id);
        self.sessions.write().await.insert(id, stored);
        Ok(id)
    }

    async fn samples_between(
        &self,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<Vec<TreadmillSample>> {
        if end < start {
            return Ok(Vec::new());
        }
        Ok(self
            .samples
            .read()
            .await
            .range(start..=end)
            .map(|(_, sample)| sample.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TreadmillData;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn sample(secs: u64) -> TreadmillSample {
        let data = TreadmillData {
            instantaneous_speed_kmh: 5.0,
            elapsed_time_s: u16::try_from(secs).unwrap(),
            ..TreadmillData::default()
        };
        TreadmillSample::from_data(&data, at(secs))
    }

    #[tokio::test]
    async fn test_samples_between_is_inclusive_and_ordered() {
        let store = MemoryStore::new();
        for secs in [30, 10, 20, 40] {
            assert_ok!(store.append_sample(&sample(secs)).await);
        }

        let range = store.samples_between(at(10), at(30)).await.unwrap();
        let times: Vec<u16> = range.iter().map(|s| s.elapsed_seconds).collect();
        assert_eq!(times, vec![10, 20, 30]);

        assert!(store.samples_between(at(30), at(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_timestamp_replaces() {
        let store = MemoryStore::new();
        store.append_sample(&sample(5)).await.unwrap();
        store.append_sample(&sample(5)).await.unwrap();
        assert_eq!(store.sample_count().await, 1);
    }

    #[tokio::test]
    async fn test_session_ids_increment() {
        let store = MemoryStore::new();
        let session = Session {
            id: None,
            started_at: at(0),
            ended_at: at(600),
            duration_seconds: 600,
            distance_miles: 1.0,
            average_speed_mph: 3.0,
            energy_kcal: 80,
        };

        assert_eq!(store.append_session(&session).await.unwrap(), 1);
        assert_eq!(store.append_session(&session).await.unwrap(), 2);

        let stored = store.sessions().await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].id, Some(2));
    }
}
