//! "Hot" ranking over vote score and creation time.

/// Reference epoch subtracted from creation timestamps.
pub const EPOCH: i64 = 1_134_028_003;
/// Seconds of age worth one order of magnitude of score.
pub const DECAY_SECONDS: f64 = 45_000.0;

const PRECISION: i32 = 7;

/// Ranking for a post with `score` created at `created_at`.
///
/// Score contributes on a log10 scale with its sign; age contributes
/// linearly. The result is rounded half-up to seven decimals so stored and
/// recomputed values compare equal.
pub fn rank(score: i64, created_at: u64) -> f64 {
    let order = (score.unsigned_abs().max(1) as f64).log10();
    let sign = score.signum() as f64;
    let age = (created_at as i64 - EPOCH) as f64 / DECAY_SECONDS;
    round_half_up(sign * order + age, PRECISION)
}

fn round_half_up(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale + 0.5).floor() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_at_epoch() {
        assert_eq!(rank(0, EPOCH as u64), 0.0);
    }

    #[test]
    fn known_values() {
        // One decay period after the epoch, no votes.
        assert_eq!(rank(0, EPOCH as u64 + 45_000), 1.0);
        // Ten votes add one unit; ten downvotes subtract one.
        assert_eq!(rank(10, EPOCH as u64), 1.0);
        assert_eq!(rank(-10, EPOCH as u64), -1.0);
        // A single vote has log10(1) = 0 magnitude.
        assert_eq!(rank(1, EPOCH as u64), 0.0);
        assert_eq!(rank(0, 1_700_000_000), 12577.1554889);
    }

    #[test]
    fn deterministic() {
        for (score, ts) in [(3, 1_650_000_000), (-7, 1_234_567_890), (123, 1_700_000_123)] {
            assert_eq!(rank(score, ts).to_bits(), rank(score, ts).to_bits());
        }
    }

    #[test]
    fn rounds_to_seven_decimals() {
        let r = rank(2, 1_700_000_001);
        let scaled = r * 1e7;
        assert!((scaled - scaled.round()).abs() < 1e-3);
    }

    #[test]
    fn monotonic_in_score_and_time() {
        let ts = 1_700_000_000;
        let mut prev = f64::MIN;
        for score in -50..=50 {
            let r = rank(score, ts);
            assert!(r >= prev, "score {score} ranked below {}", score - 1);
            prev = r;
        }
        assert!(rank(5, ts + 1000) > rank(5, ts));
        assert!(rank(-5, ts + 1000) > rank(-5, ts));
    }

    #[test]
    fn before_epoch_is_negative() {
        assert!(rank(0, 0) < 0.0);
    }
}
