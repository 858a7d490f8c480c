//! Recovery backoff schedules

use std::time::Duration;

use super::types::RecoveryStrategy;

/// Delay before recovery attempt `attempt` (1-based), capped at `max_ms`
pub fn recovery_delay(strategy: RecoveryStrategy, attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let attempt = attempt.max(1);
    let ms = match strategy {
        RecoveryStrategy::Immediate => base_ms,
        RecoveryStrategy::Linear => base_ms.saturating_mul(attempt as u64),
        RecoveryStrategy::Exponential => {
            base_ms.saturating_mul(2u64.saturating_pow(attempt - 1))
        }
    };
    Duration::from_millis(ms.min(max_ms))
}
