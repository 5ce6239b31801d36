//! Per-session knobs supplied by the host UI or CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::detection::DEFAULT_MAX_CANDIDATES;

/// Default proximity tolerance (multiplier on the last box's longer side).
pub const DEFAULT_MOTION_TOLERANCE: f32 = 2.0;
pub const MIN_MOTION_TOLERANCE: f32 = 1.0;
pub const MAX_MOTION_TOLERANCE: f32 = 3.0;

/// Default appearance switch threshold ("strictness").
pub const DEFAULT_SWITCH_THRESHOLD: f32 = 0.55;
/// Gap between switch and keep thresholds.
const HYSTERESIS_GAP: f32 = 0.1;
/// Keep threshold never drops below this.
const KEEP_THRESHOLD_FLOOR: f32 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Run low-light enhancement before detection and compositing.
    pub low_light: bool,

    /// Enable proximity recovery ("fast-motion" mode).
    pub fast_motion: bool,
    /// Distance budget multiplier, clamped to [1.0, 3.0].
    pub motion_tolerance: f32,

    /// Enable appearance confirmation / re-identification.
    pub appearance_match: bool,
    /// Minimum similarity to accept a re-identification, in [0, 1].
    pub switch_threshold: f32,
    /// Size of the candidate set searched by the appearance matcher.
    pub max_candidates: usize,

    /// Soft (segmentation-masked) focus instead of a hard box.
    pub soft_focus: bool,
    /// Draw detection boxes and labels over the output.
    pub show_boxes: bool,

    /// Ignore click-driven re-selection.
    pub lock_target: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            low_light: false,
            fast_motion: false,
            motion_tolerance: DEFAULT_MOTION_TOLERANCE,
            appearance_match: true,
            switch_threshold: DEFAULT_SWITCH_THRESHOLD,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            soft_focus: false,
            show_boxes: true,
            lock_target: false,
        }
    }
}

impl SessionConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config {}", path.display()))?;
        let config: SessionConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config.sanitized())
    }

    /// Clamp every numeric knob into its supported range.
    pub fn sanitized(mut self) -> Self {
        self.motion_tolerance = if self.motion_tolerance.is_finite() {
            self.motion_tolerance
                .clamp(MIN_MOTION_TOLERANCE, MAX_MOTION_TOLERANCE)
        } else {
            DEFAULT_MOTION_TOLERANCE
        };
        self.switch_threshold = if self.switch_threshold.is_finite() {
            self.switch_threshold.clamp(0.0, 1.0)
        } else {
            DEFAULT_SWITCH_THRESHOLD
        };
        self.max_candidates = self.max_candidates.max(1);
        self
    }

    /// Similarity below which a continuity/proximity box is distrusted.
    pub fn keep_threshold(&self) -> f32 {
        (self.switch_threshold - HYSTERESIS_GAP).max(KEEP_THRESHOLD_FLOOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_threshold_trails_switch_with_floor() {
        let mut cfg = SessionConfig::default();
        assert!((cfg.keep_threshold() - 0.45).abs() < 1e-6);
        cfg.switch_threshold = 0.25;
        assert!((cfg.keep_threshold() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn sanitize_clamps_ranges() {
        let cfg = SessionConfig {
            motion_tolerance: 9.0,
            switch_threshold: -1.0,
            max_candidates: 0,
            ..SessionConfig::default()
        }
        .sanitized();
        assert_eq!(cfg.motion_tolerance, MAX_MOTION_TOLERANCE);
        assert_eq!(cfg.switch_threshold, 0.0);
        assert_eq!(cfg.max_candidates, 1);
    }

    #[test]
    fn proximity_recovery_is_opt_in() {
        assert!(!SessionConfig::default().fast_motion);
        let cfg: SessionConfig = serde_json::from_str(r#"{ "fast_motion": true }"#).unwrap();
        assert!(cfg.fast_motion);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: SessionConfig = serde_json::from_str(r#"{ "soft_focus": true }"#).unwrap();
        assert!(cfg.soft_focus);
        assert_eq!(cfg.motion_tolerance, DEFAULT_MOTION_TOLERANCE);
        assert_eq!(cfg.max_candidates, DEFAULT_MAX_CANDIDATES);
    }
}
