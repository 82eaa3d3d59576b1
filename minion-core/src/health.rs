//! HP model - per-turn token pressure mapped to a health state.
//!
//! HP is derived from the most recent turn's input tokens against the
//! context-window limit. Cumulative token counters are accounting metrics
//! and never feed the percentage (failure-loop invocations inflate them).

use crate::HpMode;
use serde::{Deserialize, Serialize};

/// Alert thresholds, checked in descending order. Each fires at most once
/// per run while HP stays below 50%.
pub const HP_ALERT_THRESHOLDS: [u8; 2] = [25, 10];

/// Health state derived from the HP percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HpState {
    Healthy,
    Wounded,
    Critical,
}

impl HpState {
    pub fn from_pct(pct: u8) -> Self {
        if pct > 50 {
            HpState::Healthy
        } else if pct > 25 {
            HpState::Wounded
        } else {
            HpState::Critical
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HpState::Healthy => "Healthy",
            HpState::Wounded => "Wounded",
            HpState::Critical => "CRITICAL",
        }
    }
}

/// A computed HP reading. `Unknown` means no telemetry is available - there
/// is no sentinel limit; absence is represented, not encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HpReading {
    Known { pct: u8, used: u64, limit: u64, state: HpState },
    Unknown,
}

impl HpReading {
    /// Compute HP from per-turn input tokens against a limit.
    ///
    /// Usage saturates at the limit, so `turn_input >= limit` reads 0%.
    pub fn compute(turn_input: u64, limit: u64) -> Self {
        if limit == 0 {
            return HpReading::Unknown;
        }
        let used = turn_input.min(limit);
        let pct_used = (used as f64 / limit as f64) * 100.0;
        let pct = (100.0 - pct_used).round().max(0.0) as u8;
        HpReading::Known {
            pct,
            used,
            limit,
            state: HpState::from_pct(pct),
        }
    }

    /// Derive a reading from persisted agent telemetry columns, honoring the
    /// agent's HP mode.
    pub fn from_telemetry(
        mode: HpMode,
        turn_input: Option<u64>,
        cumulative_input: Option<u64>,
        limit: Option<u64>,
    ) -> Self {
        if mode == HpMode::None {
            return HpReading::Unknown;
        }
        let limit = match limit {
            Some(l) if l > 0 => l,
            _ => return HpReading::Unknown,
        };
        // Per-turn input is the real context pressure; cumulative is a
        // saturating fallback for agents that predate turn telemetry.
        let used = match turn_input {
            Some(t) if t > 0 => t,
            _ => match cumulative_input {
                Some(c) if c > 0 => c.min(limit),
                _ => return HpReading::Unknown,
            },
        };
        HpReading::compute(used, limit)
    }

    pub fn pct(&self) -> Option<u8> {
        match self {
            HpReading::Known { pct, .. } => Some(*pct),
            HpReading::Unknown => None,
        }
    }

    pub fn state(&self) -> Option<HpState> {
        match self {
            HpReading::Known { state, .. } => Some(*state),
            HpReading::Unknown => None,
        }
    }

    /// Human-readable summary, e.g. `72% HP [56k/200k] - Healthy`.
    pub fn summary(&self) -> String {
        match self {
            HpReading::Known { pct, used, limit, state } => format!(
                "{}% HP [{}k/{}k] - {}",
                pct,
                used / 1000,
                limit / 1000,
                state.label()
            ),
            HpReading::Unknown => "HP unknown".to_string(),
        }
    }
}

/// Which alert thresholds newly fire when HP drops to `pct`, given the set
/// already fired this run. Recovery above 50% clears the fired set.
pub fn alerts_to_fire(pct: u8, already_fired: &[u8]) -> Vec<u8> {
    if pct > 50 {
        return Vec::new();
    }
    HP_ALERT_THRESHOLDS
        .iter()
        .copied()
        .filter(|t| pct <= *t && !already_fired.contains(t))
        .collect()
}

/// Whether a reading above the recovery bar should clear the fired set.
pub fn clears_alerts(pct: u8) -> bool {
    pct > 50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_context_reads_zero() {
        let r = HpReading::compute(200_000, 200_000);
        assert_eq!(r.pct(), Some(0));
        assert_eq!(r.state(), Some(HpState::Critical));
    }

    #[test]
    fn usage_saturates_at_limit() {
        let r = HpReading::compute(950_000, 200_000);
        assert_eq!(r.pct(), Some(0));
    }

    #[test]
    fn state_boundaries() {
        assert_eq!(HpState::from_pct(51), HpState::Healthy);
        assert_eq!(HpState::from_pct(50), HpState::Wounded);
        assert_eq!(HpState::from_pct(26), HpState::Wounded);
        assert_eq!(HpState::from_pct(25), HpState::Critical);
        assert_eq!(HpState::from_pct(0), HpState::Critical);
    }

    #[test]
    fn no_telemetry_is_unknown_not_sentinel() {
        assert_eq!(
            HpReading::from_telemetry(HpMode::None, Some(50_000), Some(50_000), Some(200_000)),
            HpReading::Unknown
        );
        assert_eq!(
            HpReading::from_telemetry(HpMode::Daemon, None, None, Some(200_000)),
            HpReading::Unknown
        );
        assert_eq!(
            HpReading::from_telemetry(HpMode::Daemon, Some(10_000), None, None),
            HpReading::Unknown
        );
    }

    #[test]
    fn alert_firing_is_idempotent_per_threshold() {
        assert_eq!(alerts_to_fire(24, &[]), vec![25]);
        assert_eq!(alerts_to_fire(24, &[25]), Vec::<u8>::new());
        assert_eq!(alerts_to_fire(9, &[25]), vec![10]);
        assert_eq!(alerts_to_fire(9, &[]), vec![25, 10]);
        assert_eq!(alerts_to_fire(60, &[25, 10]), Vec::<u8>::new());
        assert!(clears_alerts(51));
        assert!(!clears_alerts(50));
    }

    #[test]
    fn summary_formats() {
        let r = HpReading::compute(56_000, 200_000);
        assert_eq!(r.summary(), "72% HP [56k/200k] - Healthy");
        assert_eq!(HpReading::Unknown.summary(), "HP unknown");
    }
}
