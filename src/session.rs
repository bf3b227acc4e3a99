//! Workout session boundaries inferred from training status transitions.
//!
//! The protocol carries no session identifier. A session opens on
//! Pre-Workout and closes on Post-Workout; its duration, distance and energy
//! come from the last running sample, never from the host clock.

use crate::{
    error::{FtmsError, Result},
    types::{Session, TrainingStatus, TrainingStatusKind, TreadmillSample},
};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Session bounds and totals, waiting for the average speed lookup
#[derive(Debug, Clone, PartialEq)]
pub struct SessionWindow {
    /// Session start
    pub started_at: SystemTime,
    /// Session end (the Post-Workout timestamp)
    pub ended_at: SystemTime,
    /// Timestamp of the last running sample; upper bound of the sample query
    pub last_sample_at: SystemTime,
    /// Machine-reported elapsed time
    pub duration_seconds: u32,
    /// Distance in miles
    pub distance_miles: f64,
    /// Energy in kcal
    pub energy_kcal: u32,
}

impl SessionWindow {
    /// Finish the session with an average speed from stored samples
    #[must_use]
    pub fn into_session(self, average_speed_mph: f64) -> Session {
        Session {
            id: None,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_seconds: self.duration_seconds,
            distance_miles: self.distance_miles,
            average_speed_mph,
            energy_kcal: self.energy_kcal,
        }
    }
}

/// What a status transition means for the current session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStep {
    /// Nothing changes
    NoOp,
    /// A session opened at this time
    SetStart(SystemTime),
    /// The session closed
    End(SessionWindow),
}

/// Decide what `status` does to the session
///
/// `session_start` is the start recorded so far, `last_sample` the last
/// sample taken while the belt was running.
///
/// # Errors
///
/// Returns [`FtmsError::NoSampleForSessionEnd`] on Post-Workout with no
/// sample, and [`FtmsError::EmptySession`] when the start is not strictly
/// before the end.
pub fn assemble(
    session_start: Option<SystemTime>,
    status: &TrainingStatus,
    last_sample: Option<&TreadmillSample>,
) -> Result<SessionStep> {
    match status.kind {
        TrainingStatusKind::PreWorkout => {
            if session_start.is_some() {
                debug!("Pre-Workout seen with a session already open, restarting it");
            }
            Ok(SessionStep::SetStart(status.timestamp))
        }
        TrainingStatusKind::PostWorkout => {
            let sample = last_sample.ok_or(FtmsError::NoSampleForSessionEnd)?;
            let elapsed = Duration::from_secs(u64::from(sample.elapsed_seconds));
            // connected mid-session: Pre-Workout was never observed
            let started_at = session_start.unwrap_or_else(|| {
                status
                    .timestamp
                    .checked_sub(elapsed)
                    .unwrap_or(SystemTime::UNIX_EPOCH)
            });
            let ended_at = status.timestamp;
            if started_at >= ended_at {
                return Err(FtmsError::EmptySession);
            }

            Ok(SessionStep::End(SessionWindow {
                started_at,
                ended_at,
                last_sample_at: sample.timestamp,
                duration_seconds: u32::from(sample.elapsed_seconds),
                distance_miles: sample.distance_miles,
                energy_kcal: u32::from(sample.energy_kcal),
            }))
        }
        TrainingStatusKind::Idle | TrainingStatusKind::ManualMode => Ok(SessionStep::NoOp),
    }
}

/// Mean speed in mph over stored samples; 0 for an empty range
#[must_use]
pub fn average_speed(samples: &[TreadmillSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples.iter().map(|sample| sample.speed_mph).sum();
    total / samples.len() as f64
}
