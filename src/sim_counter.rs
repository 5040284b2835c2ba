//! Derives imported/exported energy totals from instantaneous power samples.
//!
//! Each sample is integrated over the time elapsed since the previous one,
//! using the present power. A sample that arrives too long after its
//! predecessor, or before it, only rebases the timestamp. Totals are persisted
//! on every update so a restart continues from the last accepted sample.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::counter_store::{CounterKey, CounterStore, CumulativeCounterState};
use crate::error::{PollError, Result};

pub const DEFAULT_MAX_SAMPLE_GAP: Duration = Duration::from_secs(300);

/// Which bucket receives the energy of a positive power sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    PositiveIsExport,
    PositiveIsImport,
}

pub struct CumulativeCounter {
    key: CounterKey,
    store: Arc<dyn CounterStore>,
    orientation: Orientation,
    max_sample_gap: Duration,
    loaded: bool,
    state: Option<CumulativeCounterState>,
}

impl CumulativeCounter {
    pub fn new(key: CounterKey, store: Arc<dyn CounterStore>) -> Self {
        Self {
            key,
            store,
            orientation: Orientation::default(),
            max_sample_gap: DEFAULT_MAX_SAMPLE_GAP,
            loaded: false,
            state: None,
        }
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_max_sample_gap(mut self, max_sample_gap: Duration) -> Self {
        self.max_sample_gap = max_sample_gap;
        self
    }

    /// Last accepted state, `None` before the first successful update
    pub fn state(&self) -> Option<CumulativeCounterState> {
        self.state
    }

    /// Integrates `power` (W) sampled now. Returns `(imported, exported)` in Wh.
    pub async fn update(&mut self, power: f64) -> Result<(f64, f64)> {
        self.update_at(power, now_secs()).await
    }

    /// Integrates `power` (W) sampled at `timestamp` (unix seconds)
    pub async fn update_at(&mut self, power: f64, timestamp: f64) -> Result<(f64, f64)> {
        if !power.is_finite() || !timestamp.is_finite() {
            return Err(PollError::Protocol(format!(
                "{}: rejecting sample power={power} timestamp={timestamp}",
                self.key
            )));
        }
        if !self.loaded {
            self.state = self.store.load(&self.key).await?;
            self.loaded = true;
            tracing::debug!("{}: loaded counter state {:?}", self.key, self.state);
        }

        let next = self.advance(power, timestamp);
        // The in-memory state only moves once the new totals are durable
        self.store.save(&self.key, &next).await?;
        self.state = Some(next);
        Ok((next.imported, next.exported))
    }

    fn advance(&self, power: f64, timestamp: f64) -> CumulativeCounterState {
        let mut next = CumulativeCounterState {
            timestamp,
            power,
            ..self.state.unwrap_or_default()
        };
        let Some(previous) = self.state else {
            tracing::debug!("{}: first sample, starting baseline", self.key);
            return next;
        };

        let elapsed = timestamp - previous.timestamp;
        if elapsed < 0.0 || elapsed > self.max_sample_gap.as_secs_f64() {
            tracing::debug!(
                "{}: {elapsed:.1}s since last sample is out of range, rebasing",
                self.key
            );
            return next;
        }

        let energy = (power * elapsed / 3600.0).abs();
        let positive_to_export = self.orientation == Orientation::PositiveIsExport;
        if (power >= 0.0) == positive_to_export {
            next.exported += energy;
        } else {
            next.imported += energy;
        }
        next
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_store::{JsonFileStore, MemoryCounterStore};
    use async_trait::async_trait;

    const T0: f64 = 1_700_000_000.0;

    fn counter(store: &Arc<MemoryCounterStore>, prefix: &str) -> CumulativeCounter {
        CumulativeCounter::new(CounterKey::new(1, 1, prefix), store.clone())
            .with_max_sample_gap(Duration::from_secs(7200))
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    struct FailingStore {
        fail_load: bool,
    }

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn load(&self, _key: &CounterKey) -> Result<Option<CumulativeCounterState>> {
            if self.fail_load {
                return Err(PollError::Persistence("load failed".to_string()));
            }
            Ok(None)
        }

        async fn save(&self, _key: &CounterKey, _state: &CumulativeCounterState) -> Result<()> {
            Err(PollError::Persistence("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_first_sample_is_baseline() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut counter = counter(&store, "battery");
        let (imported, exported) = counter.update_at(5000.0, T0).await.unwrap();
        assert_eq!((imported, exported), (0.0, 0.0));
        assert_eq!(counter.state().unwrap().timestamp, T0);
    }

    #[tokio::test]
    async fn test_positive_power_for_an_hour_exports() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut counter = counter(&store, "battery");
        counter.update_at(1000.0, T0).await.unwrap();
        let (imported, exported) = counter.update_at(1000.0, T0 + 3600.0).await.unwrap();
        assert_close(exported, 1000.0);
        assert_eq!(imported, 0.0);
    }

    #[tokio::test]
    async fn test_sustained_power_in_small_steps() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut counter = counter(&store, "battery");
        counter.update_at(1000.0, T0).await.unwrap();
        let mut totals = (0.0, 0.0);
        for step in 1..=360 {
            totals = counter
                .update_at(1000.0, T0 + 10.0 * step as f64)
                .await
                .unwrap();
        }
        assert!((totals.1 - 1000.0).abs() < 1e-6);
        assert_eq!(totals.0, 0.0);
    }

    #[tokio::test]
    async fn test_negative_power_imports() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut counter = counter(&store, "battery");
        counter.update_at(-500.0, T0).await.unwrap();
        let (imported, exported) = counter.update_at(-500.0, T0 + 1800.0).await.unwrap();
        assert_close(imported, 250.0);
        assert_eq!(exported, 0.0);
    }

    #[tokio::test]
    async fn test_positive_is_import_orientation() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut counter =
            counter(&store, "grid").with_orientation(Orientation::PositiveIsImport);
        counter.update_at(0.0, T0).await.unwrap();
        let (imported, exported) = counter.update_at(1200.0, T0 + 1800.0).await.unwrap();
        assert_close(imported, 600.0);
        assert_eq!(exported, 0.0);
        let (imported, exported) = counter.update_at(-400.0, T0 + 2700.0).await.unwrap();
        assert_close(imported, 600.0);
        assert_close(exported, 100.0);
    }

    #[tokio::test]
    async fn test_gap_above_ceiling_rebases_without_energy() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut counter = CumulativeCounter::new(CounterKey::new(1, 1, "pv"), store.clone())
            .with_max_sample_gap(Duration::from_secs(60));
        counter.update_at(800.0, T0).await.unwrap();
        let totals = counter.update_at(800.0, T0 + 61.0).await.unwrap();
        assert_eq!(totals, (0.0, 0.0));
        assert_eq!(counter.state().unwrap().timestamp, T0 + 61.0);

        // Integration resumes from the rebased timestamp
        let (_, exported) = counter.update_at(3600.0, T0 + 71.0).await.unwrap();
        assert_close(exported, 10.0);
    }

    #[tokio::test]
    async fn test_clock_going_backwards_rebases() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut counter = counter(&store, "battery");
        counter.update_at(3600.0, T0).await.unwrap();
        counter.update_at(3600.0, T0 + 10.0).await.unwrap();
        let (imported, exported) = counter.update_at(-3600.0, T0 - 500.0).await.unwrap();
        assert_close(exported, 10.0);
        assert_eq!(imported, 0.0);
        assert_eq!(counter.state().unwrap().timestamp, T0 - 500.0);
    }

    #[tokio::test]
    async fn test_totals_never_decrease() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut counter = counter(&store, "battery");
        let powers = [300.0, -1200.0, 0.0, 4500.0, -7.5, 12.0, -3000.0, 1.0];
        let offsets = [0.0, 10.0, 25.0, 24.0, 40.0, 9000.0, 9010.0, 9011.0];
        let mut previous = (0.0, 0.0);
        for (power, offset) in powers.iter().zip(offsets) {
            let totals = counter.update_at(*power, T0 + offset).await.unwrap();
            assert!(totals.0 >= previous.0 && totals.1 >= previous.1);
            assert!(totals.0.is_finite() && totals.1.is_finite());
            previous = totals;
        }
    }

    #[tokio::test]
    async fn test_non_finite_sample_is_rejected() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut counter = counter(&store, "battery");
        counter.update_at(100.0, T0).await.unwrap();
        let result = counter.update_at(f64::NAN, T0 + 10.0).await;
        assert!(matches!(result, Err(PollError::Protocol(_))));
        assert_eq!(counter.state().unwrap().timestamp, T0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share_state() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut battery = counter(&store, "battery");
        let mut pv = counter(&store, "pv");
        battery.update_at(1000.0, T0).await.unwrap();
        pv.update_at(1000.0, T0).await.unwrap();
        let from_battery = battery.update_at(1000.0, T0 + 36.0).await.unwrap();
        let from_pv = pv.update_at(1000.0, T0 + 36.0).await.unwrap();
        assert_close(from_battery.1, 10.0);
        assert_close(from_pv.1, 10.0);
        assert_eq!(
            store.get(&CounterKey::new(1, 1, "battery")).unwrap().exported,
            store.get(&CounterKey::new(1, 1, "pv")).unwrap().exported
        );
    }

    #[tokio::test]
    async fn test_restart_continues_from_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let key = CounterKey::new(4, 2, "battery");
        let persisted = CumulativeCounterState {
            imported: 100.0,
            exported: 50.0,
            timestamp: T0,
            power: 0.0,
        };
        JsonFileStore::new(dir.path())
            .save(&key, &persisted)
            .await
            .unwrap();

        // A new process: fresh counter over the same directory
        let store: Arc<dyn CounterStore> = Arc::new(JsonFileStore::new(dir.path()));
        let mut counter = CumulativeCounter::new(key.clone(), store.clone());
        let (imported, exported) = counter.update_at(360.0, T0 + 10.0).await.unwrap();
        assert_close(imported, 100.0);
        assert_close(exported, 51.0);

        let saved = store.load(&key).await.unwrap().unwrap();
        assert_close(saved.exported, 51.0);
        assert_eq!(saved.timestamp, T0 + 10.0);
    }

    #[tokio::test]
    async fn test_restart_after_long_downtime_does_not_integrate_gap() {
        let store = Arc::new(MemoryCounterStore::new());
        let key = CounterKey::new(1, 1, "battery");
        store.insert(
            key.clone(),
            CumulativeCounterState {
                imported: 100.0,
                exported: 50.0,
                timestamp: T0,
                power: 0.0,
            },
        );
        let mut counter = CumulativeCounter::new(key, store.clone());
        let totals = counter.update_at(5000.0, T0 + 86_400.0).await.unwrap();
        assert_eq!(totals, (100.0, 50.0));
    }

    #[tokio::test]
    async fn test_failed_save_does_not_advance() {
        let store = Arc::new(FailingStore { fail_load: false });
        let mut counter = CumulativeCounter::new(CounterKey::new(1, 1, "battery"), store);
        let result = counter.update_at(100.0, T0).await;
        assert!(matches!(result, Err(PollError::Persistence(_))));
        assert_eq!(counter.state(), None);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried_next_update() {
        let store = Arc::new(FailingStore { fail_load: true });
        let mut counter = CumulativeCounter::new(CounterKey::new(1, 1, "battery"), store);
        assert!(matches!(
            counter.update_at(100.0, T0).await,
            Err(PollError::Persistence(_))
        ));
        assert!(!counter.loaded);
    }
}
