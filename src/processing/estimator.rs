//! Time-proportional reward estimates used whenever no fresh server value is
//! available.

/// Reward earned at `now_ms` for a cycle spanning `[start_ms, end_ms)` with a
/// cap of `total_reward`. Always within `[0, total_reward]`, also when the
/// clock is behind `start_ms` or a tick was missed past `end_ms`.
pub fn estimate(start_ms: i64, end_ms: i64, total_reward: f64, now_ms: i64) -> f64 {
    let total = cap(total_reward);
    let span = end_ms.saturating_sub(start_ms);
    let progress = if span <= 0 {
        if now_ms >= end_ms {
            1.0
        } else {
            0.0
        }
    } else {
        (now_ms.saturating_sub(start_ms) as f64 / span as f64).clamp(0.0, 1.0)
    };
    (total * progress).clamp(0.0, total)
}

/// Continues from a server-confirmed `anchor_reward` observed at `anchor_ms`
/// at the cycle's nominal rate. Never drops below the anchor.
pub fn extrapolate(
    anchor_reward: f64,
    anchor_ms: i64,
    start_ms: i64,
    end_ms: i64,
    total_reward: f64,
    now_ms: i64,
) -> f64 {
    let total = cap(total_reward);
    let anchor = if anchor_reward.is_finite() {
        anchor_reward.clamp(0.0, total)
    } else {
        0.0
    };
    let span = end_ms.saturating_sub(start_ms);
    if span <= 0 {
        return anchor;
    }
    let elapsed = now_ms.saturating_sub(anchor_ms).max(0) as f64;
    let rate = total / span as f64;
    (anchor + rate * elapsed).clamp(anchor, total)
}

fn cap(total_reward: f64) -> f64 {
    if total_reward.is_finite() {
        total_reward.max(0.0)
    } else {
        0.0
    }
}
