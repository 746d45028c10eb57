//! Temporal decay for retrieval ranking.
//!
//! Recently updated memories score higher; the decay follows
//! `exp(-age / tau)` with a configurable time constant (default 30 days).

use chrono::{DateTime, Utc};

/// Exponential decay factor in (0, 1] for a memory last updated at
/// `updated_at`, evaluated at `now`. Clock skew (future timestamps) and a
/// non-positive tau both clamp to 1.0.
pub fn temporal_decay(updated_at: DateTime<Utc>, now: DateTime<Utc>, tau_days: f32) -> f32 {
    if tau_days <= 0.0 {
        return 1.0;
    }

    let age_secs = now.signed_duration_since(updated_at).num_seconds();
    if age_secs <= 0 {
        return 1.0;
    }

    let age_days = age_secs as f32 / 86_400.0;
    (-age_days / tau_days).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_memory_has_no_decay() {
        let now = Utc::now();
        assert!((temporal_decay(now, now, 30.0) - 1.0).abs() < f32::EPSILON);
        // Future timestamp (clock skew) clamps to 1.0
        assert!((temporal_decay(now + Duration::hours(1), now, 30.0) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn decay_at_tau_is_1_over_e() {
        let now = Utc::now();
        let updated = now - Duration::days(30);
        let decay = temporal_decay(updated, now, 30.0);
        assert!((decay - (-1.0f32).exp()).abs() < 0.01);
    }

    #[test]
    fn decay_is_monotone_in_age() {
        let now = Utc::now();
        let d1 = temporal_decay(now - Duration::days(1), now, 30.0);
        let d10 = temporal_decay(now - Duration::days(10), now, 30.0);
        let d100 = temporal_decay(now - Duration::days(100), now, 30.0);
        assert!(d1 > d10 && d10 > d100);
        assert!(d100 > 0.0);
    }
}
