/// 指数バックオフ+ジッター付き再試行ロジック。
///
/// Full Jitter 戦略で待機時間を決める。
use std::time::Duration;

use rand::Rng;

/// 再試行戦略の設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// 最大試行回数（初回を含む）
    pub max_attempts: usize,
    /// ベースとなる遅延時間（ミリ秒）
    pub base_delay_ms: u64,
    /// 最大遅延時間（ミリ秒）
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// 指定された試行回数に対する遅延時間を計算する（Full Jitter戦略）。
    ///
    /// `attempt` は 0 始まり。初回は待機しない。
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let shift = u32::try_from(attempt - 1).unwrap_or(u32::MAX).min(63);
        let exponential_delay = self.base_delay_ms.saturating_mul(1_u64 << shift);
        let capped_delay = exponential_delay.min(self.max_delay_ms);

        let jittered_delay = if capped_delay > 0 {
            rand::rng().random_range(0..=capped_delay)
        } else {
            0
        };

        Duration::from_millis(jittered_delay)
    }

    /// サーバーが指示した待機時間（`Retry-After`）を下限として遅延を計算する。
    #[must_use]
    pub fn delay_with_floor(&self, attempt: usize, floor: Option<Duration>) -> Duration {
        let jittered = self.delay_for_attempt(attempt);
        match floor {
            Some(floor) => jittered.max(floor.min(Duration::from_millis(self.max_delay_ms))),
            None => jittered,
        }
    }

    /// この試行回数が再試行可能かどうかを判定する。
    #[must_use]
    pub const fn can_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_for_attempt_zero_is_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn delay_for_attempt_grows_within_exponential_bound() {
        let config = RetryConfig::new(5, 100, 10_000);

        assert!(config.delay_for_attempt(1) <= Duration::from_millis(100));
        assert!(config.delay_for_attempt(2) <= Duration::from_millis(200));
        assert!(config.delay_for_attempt(3) <= Duration::from_millis(400));
    }

    #[test]
    fn delay_for_attempt_respects_max_delay() {
        let config = RetryConfig::new(100, 100, 500);
        assert!(config.delay_for_attempt(90) <= Duration::from_millis(500));
    }

    #[test]
    fn retry_after_acts_as_floor_but_not_above_cap() {
        let config = RetryConfig::new(5, 10, 2_000);
        let delay = config.delay_with_floor(1, Some(Duration::from_secs(1)));
        assert!(delay >= Duration::from_secs(1));

        let capped = config.delay_with_floor(1, Some(Duration::from_secs(60)));
        assert_eq!(capped, Duration::from_millis(2_000));
    }

    #[test]
    fn can_retry_respects_max_attempts() {
        let config = RetryConfig::new(3, 100, 1000);

        assert!(config.can_retry(0));
        assert!(config.can_retry(2));
        assert!(!config.can_retry(3));
    }

    #[test]
    fn full_jitter_provides_variation() {
        let config = RetryConfig::new(5, 100, 10_000);
        let delays: Vec<Duration> = (0..16).map(|_| config.delay_for_attempt(4)).collect();
        let all_same = delays.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_same, "jitter should produce varying delays");
    }
}
