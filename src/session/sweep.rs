//! Scripted motor sweeps and the multi-run calibration program.
//!
//! Grounded on `EDMOProgram.py`'s `EDMOMotorProgram`/`EDMOProgram`. The
//! zero-crossing-after-reversal completion test in `SweepDetector::observe`
//! is translated condition-for-condition from `EDMOMotorProgram.onMotorUpdate`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use super::Session;
use crate::error::Result;

/// Tracks one motor's progress toward "has swept past both its positive and
/// negative extremes, and is currently crossing zero again".
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepDetector {
    reverse: Option<bool>,
    endpass: [bool; 2],
}

impl SweepDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `current`/`previous` are the motor's angle this tick and last tick.
    /// Returns `true` once the sweep has touched both ends and is crossing
    /// zero on this observation.
    pub fn observe(&mut self, current: f32, previous: f32) -> bool {
        if current == previous {
            return false;
        }

        let direction = current < previous;
        if self.reverse.is_none() {
            self.reverse = Some(direction);
        }

        if self.reverse != Some(direction) {
            self.reverse = Some(direction);
            if current >= 80.0 {
                self.endpass[0] = true;
            } else if current <= -80.0 {
                self.endpass[1] = true;
            }
        }

        let crossed_zero = (current <= 0.0 && previous >= 0.0) || (current >= 0.0 && previous <= 0.0);
        crossed_zero && self.endpass[0] && self.endpass[1]
    }
}

/// Settle time after a sweep's motor is stopped, before the caller proceeds.
const SWEEP_SETTLE: Duration = Duration::from_secs(2);

/// Drives one motor through a full sweep (both end-stops, then a final
/// zero-crossing) and stops it, waiting for telemetry-driven completion
/// rather than a fixed timer.
pub async fn run_motor_sweep(session: &Arc<Session>, motor_id: u8, freq: f32, amp: f32) -> Result<()> {
    let notify = Arc::new(Notify::new());

    {
        let mut state = session.state.lock().await;
        state.sweep_detectors.insert(motor_id, SweepDetector::new());
        state.sweep_watchers.insert(motor_id, notify.clone());
    }

    session.admin_set_motor(motor_id, "freq", &freq.to_string()).await;
    session.admin_set_motor(motor_id, "amp", &amp.to_string()).await;

    notify.notified().await;

    session.admin_set_motor(motor_id, "freq", "0").await;
    session.admin_set_motor(motor_id, "amp", "0").await;

    tokio::time::sleep(SWEEP_SETTLE).await;

    let mut state = session.state.lock().await;
    state.sweep_detectors.remove(&motor_id);
    state.sweep_watchers.remove(&motor_id);

    Ok(())
}

const SWEEP_FREQ: f32 = 0.05;
const SWEEP_AMP: f32 = 90.0;

/// Runs the full three-motor calibration program `repeats` times, tagging
/// every logged run with `anomaly`. Mirrors `EDMOProgram.run`.
pub async fn run_program(session: &Arc<Session>, anomaly: &str, repeats: usize) -> Result<()> {
    for _ in 0..repeats {
        session.start_log().await?;
        session.reset().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.log_program_row(anomaly, "run0").await?;
        run_motor_sweep(session, 0, SWEEP_FREQ, SWEEP_AMP).await?;

        session.log_program_row(anomaly, "run1").await?;
        run_motor_sweep(session, 1, SWEEP_FREQ, SWEEP_AMP).await?;

        session.log_program_row(anomaly, "run2").await?;
        run_motor_sweep(session, 2, SWEEP_FREQ, SWEEP_AMP).await?;

        session.log_program_row(anomaly, "run012").await?;
        tokio::try_join!(
            run_motor_sweep(session, 0, SWEEP_FREQ, SWEEP_AMP),
            run_motor_sweep(session, 1, SWEEP_FREQ, SWEEP_AMP),
            run_motor_sweep(session, 2, SWEEP_FREQ, SWEEP_AMP),
        )?;

        session.stop_log().await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_completion_after_both_endpasses_and_zero_cross() {
        // Angle trace: 0 -> 10 -> 85 (peak) -> 84 -> 10 -> -85 (trough) -> -84 -> 0.
        // Endpass is only latched on the flip tick itself, matching the
        // original's `elif` attached to the direction-change branch.
        let mut detector = SweepDetector::new();
        assert!(!detector.observe(10.0, 0.0));
        assert!(!detector.observe(85.0, 10.0));
        assert!(!detector.observe(84.0, 85.0)); // flips downward while still >= 80: endpass[0]
        assert!(!detector.observe(10.0, 84.0));
        assert!(!detector.observe(-85.0, 10.0));
        assert!(!detector.observe(-84.0, -85.0)); // flips upward while still <= -80: endpass[1]
        assert!(detector.observe(0.0, -84.0)); // crosses zero with both endpasses set
    }

    #[test]
    fn no_change_never_completes() {
        let mut detector = SweepDetector::new();
        assert!(!detector.observe(10.0, 10.0));
    }
}
