//! Round-trip clock offset estimation between a participant and the host.
//!
//! The participant is the requester: it stamps a request with its local send
//! time, the host answers with its own clock reading, and the participant
//! stamps the answer on receipt. Assuming a symmetric path, the host read its
//! clock half a round trip after the request left, which yields the offset to
//! add to local timestamps to express them on the host clock.

use std::{
    collections::{HashMap, VecDeque},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

use crate::config::ClockSyncConfig;

/// Timestamps are milliseconds since the Unix epoch, as floating point so that
/// sub-millisecond clocks (and half round trips) stay exact.
pub type Millis = f64;

/// Current wall-clock time in [`Millis`].
pub fn now_ms() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64() * 1_000.0)
        .unwrap_or_default()
}

/// Rejected sample inputs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockSyncError {
    /// The answer was stamped before the request left.
    #[error("sample received at {receive} before it was sent at {send}")]
    ReceiveBeforeSend {
        /// Local send time.
        send: Millis,
        /// Local receive time.
        receive: Millis,
    },
    /// A timestamp was NaN or infinite.
    #[error("sample contains a non-finite timestamp")]
    NonFinite,
}

/// One completed round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSyncSample {
    /// Local time the request left.
    pub local_send_time: Millis,
    /// Host clock reading carried by the answer.
    pub authoritative_time: Millis,
    /// Local time the answer arrived.
    pub local_receive_time: Millis,
    /// `local_receive_time - local_send_time`.
    pub round_trip_time_ms: Millis,
    /// Host clock minus local clock, estimated at the midpoint of the round trip.
    pub offset_ms: Millis,
}

impl ClockSyncSample {
    /// Derive round trip and offset from the three raw timestamps.
    pub fn new(
        local_send_time: Millis,
        authoritative_time: Millis,
        local_receive_time: Millis,
    ) -> Result<Self, ClockSyncError> {
        if !(local_send_time.is_finite()
            && authoritative_time.is_finite()
            && local_receive_time.is_finite())
        {
            return Err(ClockSyncError::NonFinite);
        }
        if local_receive_time < local_send_time {
            return Err(ClockSyncError::ReceiveBeforeSend {
                send: local_send_time,
                receive: local_receive_time,
            });
        }

        let round_trip_time_ms = local_receive_time - local_send_time;
        let estimated_authoritative_receive_time = local_send_time + round_trip_time_ms / 2.0;
        let offset_ms = authoritative_time - estimated_authoritative_receive_time;

        Ok(Self {
            local_send_time,
            authoritative_time,
            local_receive_time,
            round_trip_time_ms,
            offset_ms,
        })
    }
}

/// Bounded sliding window of the most recent samples.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<ClockSyncSample>,
    capacity: usize,
    last_sync_at: Option<Millis>,
}

impl SampleWindow {
    /// Create an empty window keeping at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            last_sync_at: None,
        }
    }

    /// Append a sample, evicting the oldest one when full.
    pub fn push(&mut self, sample: ClockSyncSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.last_sync_at = Some(sample.local_receive_time);
        self.samples.push_back(sample);
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample has been retained yet.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Median offset of the window, `None` while empty.
    pub fn median_offset(&self) -> Option<Millis> {
        median(self.samples.iter().map(|sample| sample.offset_ms).collect())
    }

    /// Local receive time of the most recent sample.
    pub fn last_sync_at(&self) -> Option<Millis> {
        self.last_sync_at
    }
}

fn median(mut values: Vec<Millis>) -> Option<Millis> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Result of recording a sample for a participant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStatus {
    /// Current median offset.
    pub offset_ms: Millis,
    /// Samples in the window.
    pub samples: usize,
    /// Whether enough samples were collected to trust the offset.
    pub synced: bool,
}

/// Per-participant sample windows; publishes only the derived offsets.
#[derive(Debug, Clone)]
pub struct ClockSyncEngine {
    windows: HashMap<String, SampleWindow>,
    window_size: usize,
    samples_needed: usize,
}

impl ClockSyncEngine {
    /// Create an engine with the configured window size and readiness threshold.
    pub fn new(config: &ClockSyncConfig) -> Self {
        Self {
            windows: HashMap::new(),
            window_size: config.window_size,
            samples_needed: config.samples_needed,
        }
    }

    /// Record a sample for `participant_id` and return its updated status.
    pub fn record(&mut self, participant_id: &str, sample: ClockSyncSample) -> SyncStatus {
        let window_size = self.window_size;
        let window = self
            .windows
            .entry(participant_id.to_string())
            .or_insert_with(|| SampleWindow::new(window_size));
        window.push(sample);

        SyncStatus {
            offset_ms: window.median_offset().unwrap_or_default(),
            samples: window.len(),
            synced: window.len() >= self.samples_needed,
        }
    }

    /// Current offset for `participant_id`, zero when nothing is known yet.
    pub fn offset(&self, participant_id: &str) -> Millis {
        self.windows
            .get(participant_id)
            .and_then(SampleWindow::median_offset)
            .unwrap_or_default()
    }

    /// Whether `participant_id` has collected enough samples.
    pub fn is_synced(&self, participant_id: &str) -> bool {
        self.windows
            .get(participant_id)
            .is_some_and(|window| window.len() >= self.samples_needed)
    }

    /// Local time of the most recent sample for `participant_id`.
    pub fn last_sync_at(&self, participant_id: &str) -> Option<Millis> {
        self.windows
            .get(participant_id)
            .and_then(SampleWindow::last_sync_at)
    }

    /// Drop the window of a departed participant.
    pub fn forget(&mut self, participant_id: &str) {
        self.windows.remove(participant_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ClockSyncEngine {
        ClockSyncEngine::new(&ClockSyncConfig::default())
    }

    #[test]
    fn sample_matches_symmetric_latency_formulas() {
        let triples = [
            (1_000.0, 5_000.0, 1_100.0),
            (0.0, 0.0, 0.0),
            (2_000.5, 1_000.25, 2_003.5),
            (10.0, 10_000.0, 410.0),
        ];
        for (send, authoritative, receive) in triples {
            let sample = ClockSyncSample::new(send, authoritative, receive).unwrap();
            let rtt = receive - send;
            assert_eq!(sample.round_trip_time_ms, rtt);
            assert_eq!(sample.offset_ms, authoritative - (send + rtt / 2.0));
        }
    }

    #[test]
    fn worked_example() {
        let sample = ClockSyncSample::new(1_000.0, 5_050.0, 1_100.0).unwrap();
        assert_eq!(sample.round_trip_time_ms, 100.0);
        assert_eq!(sample.offset_ms, 4_000.0);
    }

    #[test]
    fn rejects_receive_before_send() {
        let err = ClockSyncSample::new(1_000.0, 0.0, 999.0).unwrap_err();
        assert!(matches!(err, ClockSyncError::ReceiveBeforeSend { .. }));
        assert_eq!(
            ClockSyncSample::new(f64::NAN, 0.0, 1.0).unwrap_err(),
            ClockSyncError::NonFinite
        );
    }

    #[test]
    fn median_ignores_single_outlier() {
        let mut engine = engine();
        for (i, offset) in [100.0, 102.0, 98.0, 101.0, 99.0].into_iter().enumerate() {
            let send = i as f64 * 1_000.0;
            let sample = ClockSyncSample::new(send, send + 10.0 + offset, send + 20.0).unwrap();
            engine.record("p1", sample);
        }
        let before = engine.offset("p1");
        assert_eq!(before, 100.0);

        let outlier = ClockSyncSample::new(9_000.0, 9_010.0 + 5_000.0, 9_020.0).unwrap();
        let status = engine.record("p1", outlier);

        assert!((status.offset_ms - before).abs() <= 1.0);
    }

    #[test]
    fn even_window_uses_mean_of_middle_pair() {
        let mut window = SampleWindow::new(10);
        for offset in [10.0, 20.0, 30.0, 40.0] {
            window.push(ClockSyncSample::new(0.0, offset, 0.0).unwrap());
        }
        assert_eq!(window.median_offset(), Some(25.0));
    }

    #[test]
    fn window_keeps_last_ten() {
        let mut window = SampleWindow::new(10);
        for i in 0..15 {
            let t = i as f64;
            window.push(ClockSyncSample::new(t, t + 1_000.0 * t, t).unwrap());
        }
        assert_eq!(window.len(), 10);
        // Offsets retained are 5_000 ..= 14_000.
        assert_eq!(window.median_offset(), Some(9_500.0));
        assert_eq!(window.last_sync_at(), Some(14.0));
    }

    #[test]
    fn readiness_requires_samples_needed() {
        let mut engine = engine();
        assert!(!engine.is_synced("p1"));
        assert_eq!(engine.offset("p1"), 0.0);

        let sample = ClockSyncSample::new(0.0, 50.0, 0.0).unwrap();
        assert!(!engine.record("p1", sample).synced);
        assert!(!engine.record("p1", sample).synced);
        let status = engine.record("p1", sample);
        assert!(status.synced);
        assert_eq!(status.samples, 3);
        assert!(engine.is_synced("p1"));

        engine.forget("p1");
        assert!(!engine.is_synced("p1"));
    }
}
