//! tracking — target lock and the per-frame recovery cascade
//!
//! Every frame the locked subject is looked for in three stages, each only
//! consulted when the previous one came up empty (or, for appearance,
//! distrusted what the earlier stages found):
//!
//!   1. continuity: the detector still reports the locked identity
//!   2. proximity: nearest box to where the subject was last seen
//!   3. appearance: descriptor confirmation and re-identification
//!
//! A frame where nothing resolves is not a loss of lock: the identity,
//! last box and descriptor are carried forward unchanged.

pub mod click;

use tracing::debug;

use crate::appearance::{similarity, AppearanceDescriptor, AppearanceMatcher};
use crate::config::SessionConfig;
use crate::detection::{find_by_identity, top_candidates, BoundingBox, DetectionRecord, TrackId};
use crate::video::RgbFrame;

pub use click::{resolve_click, Selection, SelectionError};

// ── Lock state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Cross-frame memory of the followed subject.
///
/// Locked exactly when an identity is held. The descriptor is captured once
/// at selection and not refreshed on re-identification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetLock {
    identity: Option<TrackId>,
    last_box: Option<BoundingBox>,
    descriptor: Option<AppearanceDescriptor>,
}

impl TargetLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LockState {
        if self.identity.is_some() {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state() == LockState::Locked
    }

    pub fn identity(&self) -> Option<TrackId> {
        self.identity
    }

    pub fn last_box(&self) -> Option<BoundingBox> {
        self.last_box
    }

    pub fn descriptor(&self) -> Option<&AppearanceDescriptor> {
        self.descriptor.as_ref()
    }

    /// Lock onto a selected subject. Replaces any previous lock wholesale.
    pub fn engage(&mut self, selection: Selection, descriptor: Option<AppearanceDescriptor>) {
        debug!(track_id = %selection.track_id, bbox = ?selection.bbox, "lock engaged");
        self.identity = Some(selection.track_id);
        self.last_box = Some(selection.bbox);
        self.descriptor = descriptor;
    }

    /// Back to Unlocked; clears identity, last box and descriptor.
    pub fn clear(&mut self) {
        self.identity = None;
        self.last_box = None;
        self.descriptor = None;
    }

    fn hand_off(&mut self, to: TrackId) {
        if self.identity != Some(to) {
            debug!(from = ?self.identity, to = %to, "identity hand-off");
            self.identity = Some(to);
        }
    }
}

// ── Cascade ──────────────────────────────────────────────────────────────────

/// Which stage produced the frame's box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The box the user clicked, on the frame the click was made.
    Selected,
    Continuity,
    Proximity,
    Reidentified,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolved {
    pub bbox: BoundingBox,
    pub via: Resolution,
    /// Appearance similarity behind the decision, when one was computed.
    pub similarity: Option<f32>,
}

/// Distance budget for proximity recovery: the longer side of `last` (each
/// side floored at 1 px) times `tolerance`.
pub fn proximity_budget(last: &BoundingBox, tolerance: f32) -> f32 {
    last.width().max(1).max(last.height().max(1)) as f32 * tolerance
}

/// Record whose centre is nearest `last`'s centre, provided it lies within
/// `budget`. First record wins ties.
pub fn find_by_proximity<'a>(
    records: &'a [DetectionRecord],
    last: &BoundingBox,
    budget: f32,
) -> Option<&'a DetectionRecord> {
    let mut best: Option<(f32, &DetectionRecord)> = None;
    for record in records {
        let dist = record.bbox.center_distance(last);
        if dist > budget {
            continue;
        }
        if best.map_or(true, |(d, _)| dist < d) {
            best = Some((dist, record));
        }
    }
    best.map(|(_, r)| r)
}

/// Resolve the locked subject's box for one frame, updating `lock` in place.
///
/// `matcher` is only consulted when appearance matching is enabled and the
/// lock holds a descriptor. Does nothing while unlocked.
pub fn resolve_target(
    lock: &mut TargetLock,
    frame: &RgbFrame,
    records: &[DetectionRecord],
    config: &SessionConfig,
    matcher: Option<&AppearanceMatcher>,
) -> Option<Resolved> {
    let identity = lock.identity?;

    let mut resolved = find_by_identity(records, identity).map(|r| Resolved {
        bbox: r.bbox,
        via: Resolution::Continuity,
        similarity: None,
    });

    if resolved.is_none() && config.fast_motion {
        if let Some(last) = lock.last_box {
            let budget = proximity_budget(&last, config.motion_tolerance);
            if let Some(hit) = find_by_proximity(records, &last, budget) {
                if let Some(id) = hit.track_id {
                    lock.hand_off(id);
                }
                resolved = Some(Resolved {
                    bbox: hit.bbox,
                    via: Resolution::Proximity,
                    similarity: None,
                });
            }
        }
    }

    if config.appearance_match {
        if let (Some(matcher), Some(target)) = (matcher, lock.descriptor.as_ref()) {
            resolved = match resolved {
                Some(found) => {
                    let current = matcher.describe(frame, found.bbox);
                    let sim = similarity(current.as_ref(), Some(target));
                    if sim >= config.keep_threshold() {
                        Some(Resolved {
                            similarity: Some(sim),
                            ..found
                        })
                    } else {
                        debug!(sim, keep = config.keep_threshold(), "box failed appearance check");
                        reidentify(lock, frame, records, config, matcher)
                    }
                }
                None => reidentify(lock, frame, records, config, matcher),
            };
        }
    }

    if let Some(found) = &resolved {
        lock.last_box = Some(found.bbox);
    }
    resolved
}

/// Appearance search over the top candidates; hands the lock off to the
/// winner's identity when it clears the switch threshold.
fn reidentify(
    lock: &mut TargetLock,
    frame: &RgbFrame,
    records: &[DetectionRecord],
    config: &SessionConfig,
    matcher: &AppearanceMatcher,
) -> Option<Resolved> {
    let candidates = top_candidates(records, config.max_candidates);
    let best = matcher.best_match(frame, &candidates, lock.descriptor.as_ref());
    let Some(bbox) = best.accepted(config.switch_threshold) else {
        debug!(score = best.score, switch = config.switch_threshold, "re-identification rejected");
        return None;
    };
    if let Some(id) = best.track_id {
        lock.hand_off(id);
    }
    Some(Resolved {
        bbox,
        via: Resolution::Reidentified,
        similarity: Some(best.score),
    })
}

/// While unlocked with a reference descriptor armed, lock onto the first
/// candidate that matches it well enough. The reference becomes the lock's
/// descriptor. Candidates without an identity cannot be locked.
pub fn acquire_reference(
    lock: &mut TargetLock,
    frame: &RgbFrame,
    records: &[DetectionRecord],
    config: &SessionConfig,
    matcher: &AppearanceMatcher,
    reference: &AppearanceDescriptor,
) -> Option<Resolved> {
    if lock.is_locked() {
        return None;
    }
    let candidates = top_candidates(records, config.max_candidates);
    let best = matcher.best_match(frame, &candidates, Some(reference));
    let bbox = best.accepted(config.switch_threshold)?;
    let track_id = best.track_id?;
    lock.engage(Selection { track_id, bbox }, Some(reference.clone()));
    Some(Resolved {
        bbox,
        via: Resolution::Reidentified,
        similarity: Some(best.score),
    })
}
