//! Adaptive bitrate search.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::EncodeError;

/// Default output ceiling for animated stickers (256 KB).
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 256 * 1024;
/// Default playback ceiling for animated stickers.
pub const DEFAULT_MAX_DURATION_SECS: f64 = 3.0;
/// Default width of the acceptance band below the ceiling (25 KB).
pub const DEFAULT_TOLERANCE_BYTES: u64 = 25 * 1024;
/// Default number of budget-consuming attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Size and duration constraints for one encode run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeTarget {
    pub max_size_bytes: u64,
    pub max_duration_secs: f64,
    pub tolerance_bytes: u64,
    pub max_attempts: u32,
}

impl Default for EncodeTarget {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
            tolerance_bytes: DEFAULT_TOLERANCE_BYTES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl EncodeTarget {
    fn validate(&self) -> Result<(), EncodeError> {
        if self.max_size_bytes == 0 {
            return Err(EncodeError::InvalidTarget(
                "max_size_bytes must be positive".to_string(),
            ));
        }
        if !self.max_duration_secs.is_finite() || self.max_duration_secs <= 0.0 {
            return Err(EncodeError::InvalidTarget(format!(
                "max_duration_secs must be positive, got {}",
                self.max_duration_secs
            )));
        }
        if self.tolerance_bytes > self.max_size_bytes {
            return Err(EncodeError::InvalidTarget(
                "tolerance_bytes exceeds max_size_bytes".to_string(),
            ));
        }
        Ok(())
    }

    fn max_size_kb(&self) -> f64 {
        self.max_size_bytes as f64 / 1024.0
    }

    fn tolerance_kb(&self) -> f64 {
        self.tolerance_bytes as f64 / 1024.0
    }

    /// Time-compression factor applied when the source runs longer than allowed.
    ///
    /// Never below 1; a source with an unusable duration is left at normal speed.
    pub fn speed_factor(&self, source_duration_secs: f64) -> f64 {
        if !source_duration_secs.is_finite() || source_duration_secs <= 0.0 {
            return 1.0;
        }
        (source_duration_secs / self.max_duration_secs).max(1.0)
    }

    /// Starting bitrate: the byte budget in kilobits spread over the allowed duration.
    pub fn seed_bitrate_kbps(&self) -> i64 {
        (self.max_size_kb() * 8.0 / self.max_duration_secs).floor() as i64
    }
}

/// Step size for the next bitrate adjustment, chosen by the distance to the ceiling.
pub fn step_for_gap(gap_kb: f64) -> i64 {
    if gap_kb > 100.0 {
        150
    } else if gap_kb > 50.0 {
        100
    } else if gap_kb > 25.0 {
        50
    } else {
        25
    }
}

/// An encoder that can be driven at an arbitrary bitrate.
#[async_trait]
pub trait BitrateEncoder: Send + Sync {
    /// Encode at `bitrate_kbps` with timestamps scaled by `1 / speed_factor`.
    ///
    /// Returns the size of the produced output in bytes. Any failure of the
    /// underlying tool is a hard failure of this attempt.
    async fn encode(&self, bitrate_kbps: u32, speed_factor: f64) -> Result<u64, EncodeError>;
}

/// One encoder invocation inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeAttempt {
    pub bitrate_kbps: i64,
    pub produced_size_bytes: u64,
    /// 1-based index over every invocation, counted or not.
    pub attempt_index: u32,
}

/// Terminal state of a bitrate search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateOutcome {
    Converged {
        bitrate_kbps: u32,
        size_bytes: u64,
        /// Budget-consuming attempts spent before converging.
        counted_attempts: u32,
    },
    /// The bitrate collapsed to zero or below while still over budget.
    Unsatisfiable { last_bitrate_kbps: i64 },
    Cancelled,
}

/// Outcome plus the full attempt history.
#[derive(Debug, Clone)]
pub struct RateRun {
    pub outcome: RateOutcome,
    pub attempts: Vec<EncodeAttempt>,
    pub speed_factor: f64,
}

impl RateRun {
    pub fn is_converged(&self) -> bool {
        matches!(self.outcome, RateOutcome::Converged { .. })
    }
}

/// Bounded hill-climbing search over the encoder bitrate.
///
/// Only the "too small" branch consumes the attempt budget. Overshooting the
/// ceiling always tightens the bitrate and retries, until the output fits, the
/// bitrate reaches zero, or the run is cancelled.
#[derive(Debug, Clone, Default)]
pub struct RateController {
    target: EncodeTarget,
}

impl RateController {
    pub fn new(target: EncodeTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &EncodeTarget {
        &self.target
    }

    pub async fn run<E>(
        &self,
        encoder: &E,
        source_duration_secs: f64,
        cancel: &CancellationToken,
    ) -> Result<RateRun, EncodeError>
    where
        E: BitrateEncoder + ?Sized,
    {
        self.target.validate()?;

        let speed_factor = self.target.speed_factor(source_duration_secs);
        let max_kb = self.target.max_size_kb();
        let tolerance_kb = self.target.tolerance_kb();
        let mut bitrate_kbps = self.target.seed_bitrate_kbps();
        let mut counted = 0u32;
        let mut attempts = Vec::new();

        let finish = |outcome: RateOutcome, attempts: Vec<EncodeAttempt>| RateRun {
            outcome,
            attempts,
            speed_factor,
        };

        if speed_factor > 1.0 {
            debug!(
                source_duration_secs,
                speed_factor, "Source exceeds duration limit, compressing time"
            );
        }

        if bitrate_kbps <= 0 {
            warn!(max_kb, "Size budget too small to seed a positive bitrate");
            return Ok(finish(
                RateOutcome::Unsatisfiable {
                    last_bitrate_kbps: bitrate_kbps,
                },
                attempts,
            ));
        }

        loop {
            if cancel.is_cancelled() {
                debug!(attempts = attempts.len(), "Bitrate search cancelled");
                return Ok(finish(RateOutcome::Cancelled, attempts));
            }

            let size_bytes = encoder.encode(bitrate_kbps as u32, speed_factor).await?;
            attempts.push(EncodeAttempt {
                bitrate_kbps,
                produced_size_bytes: size_bytes,
                attempt_index: attempts.len() as u32 + 1,
            });

            let size_kb = size_bytes as f64 / 1024.0;
            let step = step_for_gap((size_kb - max_kb).abs());

            let converged = RateOutcome::Converged {
                bitrate_kbps: bitrate_kbps as u32,
                size_bytes,
                counted_attempts: counted,
            };

            if counted >= self.target.max_attempts && size_kb <= max_kb {
                info!(
                    bitrate_kbps,
                    size_kb,
                    "Attempt budget spent, accepting output within ceiling"
                );
                return Ok(finish(converged, attempts));
            }

            if size_kb < max_kb - tolerance_kb {
                debug!(
                    bitrate_kbps,
                    step,
                    size_kb,
                    "Output below tolerance band, raising bitrate"
                );
                bitrate_kbps += step;
                counted += 1;
                continue;
            }

            if size_kb <= max_kb {
                info!(
                    bitrate_kbps,
                    size_kb,
                    "Output converged into tolerance band"
                );
                return Ok(finish(converged, attempts));
            }

            debug!(
                bitrate_kbps,
                step,
                size_kb,
                "Output over ceiling, lowering bitrate"
            );
            bitrate_kbps -= step;
            if bitrate_kbps <= 0 {
                warn!(
                    size_kb,
                    bitrate_kbps,
                    "Bitrate collapsed, size budget cannot be met"
                );
                return Ok(finish(
                    RateOutcome::Unsatisfiable {
                        last_bitrate_kbps: bitrate_kbps,
                    },
                    attempts,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    const KB: u64 = 1024;

    /// Replays a fixed list of sizes (in KB), repeating the last one.
    struct ScriptedEncoder {
        sizes_kb: Mutex<VecDeque<u64>>,
        last_kb: Mutex<u64>,
        seen: Mutex<Vec<(u32, f64)>>,
    }

    impl ScriptedEncoder {
        fn new(sizes_kb: &[u64]) -> Self {
            Self {
                sizes_kb: Mutex::new(sizes_kb.iter().copied().collect()),
                last_kb: Mutex::new(sizes_kb.last().copied().unwrap_or(0)),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BitrateEncoder for ScriptedEncoder {
        async fn encode(&self, bitrate_kbps: u32, speed_factor: f64) -> Result<u64, EncodeError> {
            self.seen.lock().push((bitrate_kbps, speed_factor));
            let next = self.sizes_kb.lock().pop_front();
            let kb = match next {
                Some(kb) => {
                    *self.last_kb.lock() = kb;
                    kb
                }
                None => *self.last_kb.lock(),
            };
            Ok(kb * KB)
        }
    }

    /// Output size proportional to bitrate.
    struct LinearEncoder {
        bytes_per_kbps: f64,
    }

    #[async_trait]
    impl BitrateEncoder for LinearEncoder {
        async fn encode(&self, bitrate_kbps: u32, _speed_factor: f64) -> Result<u64, EncodeError> {
            Ok((bitrate_kbps as f64 * self.bytes_per_kbps) as u64)
        }
    }

    struct FailingEncoder;

    #[async_trait]
    impl BitrateEncoder for FailingEncoder {
        async fn encode(&self, _bitrate_kbps: u32, _speed_factor: f64) -> Result<u64, EncodeError> {
            Err(EncodeError::encoder("ffmpeg exited with code 1"))
        }
    }

    #[test]
    fn test_seed_bitrate() {
        let target = EncodeTarget::default();
        // 256 KB * 8 / 3 s = 682.67
        assert_eq!(target.seed_bitrate_kbps(), 682);
    }

    #[test]
    fn test_speed_factor() {
        let target = EncodeTarget::default();
        assert_eq!(target.speed_factor(1.5), 1.0);
        assert_eq!(target.speed_factor(3.0), 1.0);
        assert!((target.speed_factor(6.0) - 2.0).abs() < f64::EPSILON);
        assert_eq!(target.speed_factor(0.0), 1.0);
        assert_eq!(target.speed_factor(f64::NAN), 1.0);
    }

    #[test]
    fn test_step_schedule() {
        assert_eq!(step_for_gap(244.0), 150);
        assert_eq!(step_for_gap(100.5), 150);
        assert_eq!(step_for_gap(100.0), 100);
        assert_eq!(step_for_gap(50.1), 100);
        assert_eq!(step_for_gap(50.0), 50);
        assert_eq!(step_for_gap(25.5), 50);
        assert_eq!(step_for_gap(25.0), 25);
        assert_eq!(step_for_gap(0.0), 25);
    }

    #[tokio::test]
    async fn test_converges_immediately_inside_band() {
        let encoder = ScriptedEncoder::new(&[240]);
        let run = RateController::default()
            .run(&encoder, 2.0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            run.outcome,
            RateOutcome::Converged {
                bitrate_kbps: 682,
                size_bytes: 240 * KB,
                counted_attempts: 0,
            }
        );
        assert_eq!(run.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_band_edges_are_inclusive() {
        for size_kb in [231, 256] {
            let encoder = ScriptedEncoder::new(&[size_kb]);
            let run = RateController::default()
                .run(&encoder, 2.0, &CancellationToken::new())
                .await
                .unwrap();
            assert!(run.is_converged(), "{size_kb} KB should converge");
            assert_eq!(run.attempts.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_overshoot_steps_narrow_with_gap() {
        // gaps: 244, 64, 34, 14 -> steps 150, 100, 50, 25
        let encoder = ScriptedEncoder::new(&[500, 320, 290, 270, 250]);
        let run = RateController::default()
            .run(&encoder, 2.0, &CancellationToken::new())
            .await
            .unwrap();

        let bitrates: Vec<i64> = run.attempts.iter().map(|a| a.bitrate_kbps).collect();
        assert_eq!(bitrates, vec![682, 532, 432, 382, 357]);
        assert!(bitrates.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(
            run.outcome,
            RateOutcome::Converged {
                bitrate_kbps: 357,
                size_bytes: 250 * KB,
                counted_attempts: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_constant_overshoot_is_unsatisfiable() {
        let encoder = ScriptedEncoder::new(&[500]);
        let run = RateController::default()
            .run(&encoder, 2.0, &CancellationToken::new())
            .await
            .unwrap();

        let bitrates: Vec<i64> = run.attempts.iter().map(|a| a.bitrate_kbps).collect();
        assert_eq!(bitrates, vec![682, 532, 382, 232, 82]);
        assert_eq!(
            run.outcome,
            RateOutcome::Unsatisfiable {
                last_bitrate_kbps: -68
            }
        );
    }

    #[tokio::test]
    async fn test_unsatisfiable_logs_under_subscriber() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let encoder = ScriptedEncoder::new(&[500]);
        let run = RateController::default()
            .run(&encoder, 2.0, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(run.outcome, RateOutcome::Unsatisfiable { .. }));
        let indices: Vec<u32> = run.attempts.iter().map(|a| a.attempt_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_undershoot_consumes_attempt_budget() {
        // Always far below the band: five raises, then accept.
        let encoder = ScriptedEncoder::new(&[10]);
        let run = RateController::default()
            .run(&encoder, 2.0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.attempts.len(), 6);
        let bitrates: Vec<i64> = run.attempts.iter().map(|a| a.bitrate_kbps).collect();
        assert_eq!(bitrates, vec![682, 832, 982, 1132, 1282, 1432]);
        assert_eq!(
            run.outcome,
            RateOutcome::Converged {
                bitrate_kbps: 1432,
                size_bytes: 10 * KB,
                counted_attempts: 5,
            }
        );
    }

    #[tokio::test]
    async fn test_overshoot_does_not_consume_budget() {
        // Oscillates: under, over, under, over ... the over branch never counts.
        let encoder = ScriptedEncoder::new(&[100, 300, 100, 300, 100, 300, 100, 300, 100, 300, 100]);
        let run = RateController::default()
            .run(&encoder, 2.0, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.attempts.len(), 11);
        assert!(matches!(
            run.outcome,
            RateOutcome::Converged {
                counted_attempts: 5,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_speed_factor_passed_to_encoder() {
        let encoder = ScriptedEncoder::new(&[250]);
        let run = RateController::default()
            .run(&encoder, 4.5, &CancellationToken::new())
            .await
            .unwrap();

        assert!((run.speed_factor - 1.5).abs() < 1e-9);
        let seen = encoder.seen.lock();
        assert!((seen[0].1 - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let encoder = ScriptedEncoder::new(&[250]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = RateController::default()
            .run(&encoder, 2.0, &cancel)
            .await
            .unwrap();

        assert_eq!(run.outcome, RateOutcome::Cancelled);
        assert!(run.attempts.is_empty());
        assert!(encoder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_encoder_failure_propagates() {
        let result = RateController::default()
            .run(&FailingEncoder, 2.0, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EncodeError::Encoder(_))));
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let controller = RateController::new(EncodeTarget {
            max_duration_secs: 0.0,
            ..Default::default()
        });
        let result = controller
            .run(&FailingEncoder, 2.0, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EncodeError::InvalidTarget(_))));
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #[test]
        fn prop_converged_output_respects_ceiling(bytes_per_kbps in 50.0f64..2048.0) {
            let controller = RateController::default();
            let target = *controller.target();
            let encoder = LinearEncoder { bytes_per_kbps };
            let run = block_on(controller.run(&encoder, 2.0, &CancellationToken::new())).unwrap();

            match run.outcome {
                RateOutcome::Converged { size_bytes, counted_attempts, .. } => {
                    prop_assert!(size_bytes <= target.max_size_bytes);
                    prop_assert!(
                        size_bytes + target.tolerance_bytes >= target.max_size_bytes
                            || counted_attempts == target.max_attempts
                    );
                    prop_assert!(counted_attempts <= target.max_attempts);
                }
                other => prop_assert!(false, "expected convergence, got {:?}", other),
            }
        }

        #[test]
        fn prop_raises_are_bounded(bytes_per_kbps in 50.0f64..2048.0) {
            let controller = RateController::default();
            let encoder = LinearEncoder { bytes_per_kbps };
            let run = block_on(controller.run(&encoder, 2.0, &CancellationToken::new())).unwrap();

            let raises = run
                .attempts
                .windows(2)
                .filter(|w| w[1].bitrate_kbps > w[0].bitrate_kbps)
                .count() as u32;
            prop_assert!(raises <= controller.target().max_attempts);
        }
    }
}
