//! Click → detection resolution for establishing a lock.

use thiserror::Error;

use crate::detection::{BoundingBox, DetectionRecord, TrackId};

/// Why a click did not produce a lock. None of these mutate session state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no detection under ({x}, {y}); click directly on the subject")]
    NoDetection { x: i32, y: i32 },

    #[error("the detection under ({x}, {y}) has no track identity to follow")]
    MissingIdentity { x: i32, y: i32 },

    #[error("target is locked; disable the lock to switch focus")]
    TargetLocked,
}

/// A resolved click: the identity to follow and its box in the clicked frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
}

/// Pick the record under `(x, y)`.
///
/// Only boxes containing the point (edges inclusive) are eligible; among
/// those carrying an identity the one whose centre is nearest the point wins,
/// first record on ties. A point outside every box is never snapped to a
/// nearby box.
pub fn resolve_click(records: &[DetectionRecord], x: i32, y: i32) -> Result<Selection, SelectionError> {
    let (px, py) = (x as f32, y as f32);
    let mut any_containing = false;
    let mut best: Option<(f32, Selection)> = None;

    for record in records.iter().filter(|r| r.bbox.contains(x, y)) {
        any_containing = true;
        let Some(track_id) = record.track_id else {
            continue;
        };
        let dist = record.bbox.distance_to_point(px, py);
        if best.as_ref().map_or(true, |(d, _)| dist < *d) {
            best = Some((
                dist,
                Selection {
                    track_id,
                    bbox: record.bbox,
                },
            ));
        }
    }

    match best {
        Some((_, selection)) => Ok(selection),
        None if any_containing => Err(SelectionError::MissingIdentity { x, y }),
        None => Err(SelectionError::NoDetection { x, y }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlapping_pair() -> Vec<DetectionRecord> {
        vec![
            DetectionRecord::new(BoundingBox::new(10, 10, 50, 50), Some(TrackId(1)), Some(0.9)),
            DetectionRecord::new(BoundingBox::new(40, 40, 80, 80), Some(TrackId(2)), Some(0.8)),
        ]
    }

    #[test]
    fn overlap_resolves_to_nearest_centre() {
        let records = overlapping_pair();
        assert_eq!(resolve_click(&records, 42, 42).unwrap().track_id, TrackId(1));
        assert_eq!(resolve_click(&records, 48, 48).unwrap().track_id, TrackId(2));
        // Equidistant from both centres: first record wins.
        assert_eq!(resolve_click(&records, 45, 45).unwrap().track_id, TrackId(1));
    }

    #[test]
    fn click_outside_every_box_selects_nothing() {
        let records = overlapping_pair();
        assert_eq!(
            resolve_click(&records, 5, 5),
            Err(SelectionError::NoDetection { x: 5, y: 5 })
        );
        assert!(resolve_click(&[], 5, 5).is_err());
    }

    #[test]
    fn containing_box_without_identity_fails() {
        let records = vec![DetectionRecord::new(BoundingBox::new(0, 0, 20, 20), None, Some(0.9))];
        assert_eq!(
            resolve_click(&records, 10, 10),
            Err(SelectionError::MissingIdentity { x: 10, y: 10 })
        );
    }

    #[test]
    fn identified_box_preferred_over_nearer_anonymous_one() {
        let records = vec![
            DetectionRecord::new(BoundingBox::new(0, 0, 20, 20), None, None),
            DetectionRecord::new(BoundingBox::new(0, 0, 60, 60), Some(TrackId(5)), None),
        ];
        let sel = resolve_click(&records, 10, 10).unwrap();
        assert_eq!(sel.track_id, TrackId(5));
        assert_eq!(sel.bbox, BoundingBox::new(0, 0, 60, 60));
    }
}
