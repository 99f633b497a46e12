//! The edit ledger: sparse, non-destructive edits against one episode.
//!
//! The ledger holds only what the annotator asked for. Effective frames,
//! resolved samples and rendered images are derived from it elsewhere and
//! keyed by [`EditLedger::version`], which every successful mutation bumps.
//! A rejected mutation leaves the ledger exactly as it was.

use std::collections::{BTreeMap, BTreeSet};

use kinedit_common::error::{KineditError, KineditResult};
use serde::{Deserialize, Serialize};

use crate::episode::CameraId;
use crate::transform::{ImageTransform, TransformSettings};

/// Interpolation factor used by [`EditLedger::insert_frame_default`].
pub const DEFAULT_INSERT_FACTOR: f64 = 0.5;

/// A synthetic frame placed after its anchor original frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Insertion {
    /// Position between the anchor (0) and its successor (1), exclusive.
    pub interpolation_factor: f64,
}

/// Pose correction for one original frame.
///
/// Deltas are added to the arm positions; gripper overrides replace the
/// recorded gripper value outright.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryAdjustment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_arm_delta: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_arm_delta: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_gripper_override: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_gripper_override: Option<f64>,
}

impl TrajectoryAdjustment {
    /// An adjustment with no fields set has no effect.
    pub fn is_empty(&self) -> bool {
        self.right_arm_delta.is_none()
            && self.left_arm_delta.is_none()
            && self.right_gripper_override.is_none()
            && self.left_gripper_override.is_none()
    }

    /// Overwrite the fields that `partial` sets, keep the rest.
    pub fn merge(&mut self, partial: &TrajectoryAdjustment) {
        if partial.right_arm_delta.is_some() {
            self.right_arm_delta = partial.right_arm_delta;
        }
        if partial.left_arm_delta.is_some() {
            self.left_arm_delta = partial.left_arm_delta;
        }
        if partial.right_gripper_override.is_some() {
            self.right_gripper_override = partial.right_gripper_override;
        }
        if partial.left_gripper_override.is_some() {
            self.left_gripper_override = partial.left_gripper_override;
        }
    }
}

/// All edits for one episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditLedger {
    /// Frame count of the episode the ledger was authored against.
    frame_count: usize,

    #[serde(default)]
    version: u64,

    #[serde(default)]
    removed_frames: BTreeSet<usize>,

    /// Keyed by anchor frame index.
    #[serde(default)]
    insertions: BTreeMap<usize, Insertion>,

    #[serde(default)]
    trajectory_adjustments: BTreeMap<usize, TrajectoryAdjustment>,

    #[serde(default)]
    transforms: TransformSettings,
}

/// Whether `anchor` has a following frame to interpolate toward.
pub fn anchor_has_successor(anchor: usize, frame_count: usize) -> bool {
    anchor < frame_count.saturating_sub(1)
}

impl EditLedger {
    /// Empty ledger for an episode with `frame_count` frames.
    pub fn new(frame_count: usize) -> Self {
        Self {
            frame_count,
            version: 0,
            removed_frames: BTreeSet::new(),
            insertions: BTreeMap::new(),
            trajectory_adjustments: BTreeMap::new(),
            transforms: TransformSettings::default(),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Monotonic mutation counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn removed_frames(&self) -> &BTreeSet<usize> {
        &self.removed_frames
    }

    pub fn insertions(&self) -> &BTreeMap<usize, Insertion> {
        &self.insertions
    }

    pub fn trajectory_adjustments(&self) -> &BTreeMap<usize, TrajectoryAdjustment> {
        &self.trajectory_adjustments
    }

    pub fn transforms(&self) -> &TransformSettings {
        &self.transforms
    }

    pub fn is_removed(&self, index: usize) -> bool {
        self.removed_frames.contains(&index)
    }

    /// True when no edit of any kind is recorded.
    pub fn is_pristine(&self) -> bool {
        self.removed_frames.is_empty()
            && self.insertions.is_empty()
            && self.trajectory_adjustments.is_empty()
            && self.transforms.is_empty()
    }

    // --- removals ---

    /// Flip the removal mark on `index`. Returns whether the frame is now removed.
    pub fn toggle_frame_removal(&mut self, index: usize) -> KineditResult<bool> {
        self.check_frame(index)?;
        let removed = if self.removed_frames.remove(&index) {
            false
        } else {
            self.removed_frames.insert(index);
            true
        };
        self.bump();
        Ok(removed)
    }

    /// Mark every frame in `start..=end` as removed. Returns how many were newly marked.
    pub fn add_frame_range(&mut self, start: usize, end: usize) -> KineditResult<usize> {
        self.check_range(start, end)?;
        let added = (start..=end)
            .filter(|i| self.removed_frames.insert(*i))
            .count();
        self.bump();
        Ok(added)
    }

    /// Mark `start`, `start + step`, ... up to `end` (inclusive) as removed.
    pub fn add_frames_by_frequency(
        &mut self,
        start: usize,
        end: usize,
        step: usize,
    ) -> KineditResult<usize> {
        if step == 0 {
            return Err(KineditError::invalid_frame_index(
                start,
                self.frame_count,
                "frequency step must be at least 1",
            ));
        }
        self.check_range(start, end)?;
        let added = (start..=end)
            .step_by(step)
            .filter(|i| self.removed_frames.insert(*i))
            .count();
        self.bump();
        Ok(added)
    }

    pub fn clear_removed_frames(&mut self) {
        self.removed_frames.clear();
        self.bump();
    }

    // --- insertions ---

    /// Insert a synthetic frame after `anchor`, replacing any existing one.
    ///
    /// The anchor needs a successor to interpolate toward, so the last frame
    /// is rejected.
    pub fn insert_frame(&mut self, anchor: usize, factor: f64) -> KineditResult<()> {
        if !anchor_has_successor(anchor, self.frame_count) {
            return Err(KineditError::invalid_frame_index(
                anchor,
                self.frame_count,
                "insertion anchor needs a following frame",
            ));
        }
        if !(factor > 0.0 && factor < 1.0) {
            return Err(KineditError::InvalidInterpolationFactor { factor });
        }
        self.insertions.insert(
            anchor,
            Insertion {
                interpolation_factor: factor,
            },
        );
        self.bump();
        Ok(())
    }

    /// Insert a midpoint frame after `anchor`.
    pub fn insert_frame_default(&mut self, anchor: usize) -> KineditResult<()> {
        self.insert_frame(anchor, DEFAULT_INSERT_FACTOR)
    }

    /// Drop the insertion at `anchor`. Returns whether one existed.
    pub fn remove_inserted_frame(&mut self, anchor: usize) -> bool {
        let existed = self.insertions.remove(&anchor).is_some();
        self.bump();
        existed
    }

    // --- trajectory adjustments ---

    /// Merge `partial` into the adjustment for `index`. Empty results are pruned.
    pub fn set_trajectory_adjustment(
        &mut self,
        index: usize,
        partial: TrajectoryAdjustment,
    ) -> KineditResult<()> {
        self.check_frame(index)?;
        let mut merged = self
            .trajectory_adjustments
            .get(&index)
            .copied()
            .unwrap_or_default();
        merged.merge(&partial);
        if merged.is_empty() {
            self.trajectory_adjustments.remove(&index);
        } else {
            self.trajectory_adjustments.insert(index, merged);
        }
        self.bump();
        Ok(())
    }

    pub fn remove_trajectory_adjustment(&mut self, index: usize) -> bool {
        let existed = self.trajectory_adjustments.remove(&index).is_some();
        self.bump();
        existed
    }

    pub fn clear_trajectory_adjustments(&mut self) {
        self.trajectory_adjustments.clear();
        self.bump();
    }

    // --- transforms ---

    pub fn set_global_transform(&mut self, transform: Option<ImageTransform>) {
        self.transforms.global = transform;
        self.bump();
    }

    /// Set or clear (`None`) the override for one camera.
    pub fn set_camera_transform(
        &mut self,
        camera_id: impl Into<CameraId>,
        transform: Option<ImageTransform>,
    ) {
        let camera_id = camera_id.into();
        match transform {
            Some(transform) => {
                self.transforms.per_camera.insert(camera_id, transform);
            }
            None => {
                self.transforms.per_camera.remove(&camera_id);
            }
        }
        self.bump();
    }

    pub fn clear_transforms(&mut self) {
        self.transforms = TransformSettings::default();
        self.bump();
    }

    /// Drop every edit. The version keeps counting up.
    pub fn reset(&mut self) {
        self.removed_frames.clear();
        self.insertions.clear();
        self.trajectory_adjustments.clear();
        self.transforms = TransformSettings::default();
        self.bump();
    }

    /// Check a ledger from outside (e.g. deserialized) against an episode.
    pub fn validate_for(&self, frame_count: usize) -> KineditResult<()> {
        if self.frame_count != frame_count {
            return Err(KineditError::invalid_frame_index(
                self.frame_count,
                frame_count,
                "ledger was authored against a different frame count",
            ));
        }
        let out_of_range = self
            .removed_frames
            .iter()
            .chain(self.trajectory_adjustments.keys())
            .find(|i| **i >= frame_count);
        if let Some(index) = out_of_range {
            return Err(KineditError::invalid_frame_index(
                *index,
                frame_count,
                "edit targets a frame outside the episode",
            ));
        }
        for (anchor, insertion) in &self.insertions {
            if !anchor_has_successor(*anchor, frame_count) {
                return Err(KineditError::invalid_frame_index(
                    *anchor,
                    frame_count,
                    "insertion anchor needs a following frame",
                ));
            }
            let factor = insertion.interpolation_factor;
            if !(factor > 0.0 && factor < 1.0) {
                return Err(KineditError::InvalidInterpolationFactor { factor });
            }
        }
        Ok(())
    }

    fn check_frame(&self, index: usize) -> KineditResult<()> {
        if index >= self.frame_count {
            return Err(KineditError::invalid_frame_index(
                index,
                self.frame_count,
                "frame index out of range",
            ));
        }
        Ok(())
    }

    fn check_range(&self, start: usize, end: usize) -> KineditResult<()> {
        if start > end {
            return Err(KineditError::invalid_frame_index(
                start,
                self.frame_count,
                format!("range start is after end {end}"),
            ));
        }
        self.check_frame(end)
    }

    fn bump(&mut self) {
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::ColorFilter;
    use proptest::prelude::*;

    #[test]
    fn test_toggle_is_idempotent_round_trip() {
        let mut ledger = EditLedger::new(10);
        assert!(ledger.toggle_frame_removal(4).unwrap());
        assert!(ledger.is_removed(4));
        assert!(!ledger.toggle_frame_removal(4).unwrap());
        assert!(ledger.removed_frames().is_empty());
        assert_eq!(ledger.version(), 2);
    }

    #[test]
    fn test_out_of_range_removal_leaves_ledger_unchanged() {
        let mut ledger = EditLedger::new(5);
        let before = ledger.clone();
        let err = ledger.toggle_frame_removal(5).unwrap_err();
        assert!(matches!(err, KineditError::InvalidFrameIndex { index: 5, .. }));
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_add_frame_range_is_inclusive() {
        let mut ledger = EditLedger::new(10);
        assert_eq!(ledger.add_frame_range(2, 4).unwrap(), 3);
        assert_eq!(
            ledger.removed_frames().iter().copied().collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        // Overlap only counts new marks.
        assert_eq!(ledger.add_frame_range(4, 5).unwrap(), 1);
    }

    #[test]
    fn test_add_frame_range_rejects_reversed_and_overflowing() {
        let mut ledger = EditLedger::new(10);
        assert!(ledger.add_frame_range(6, 2).is_err());
        assert!(ledger.add_frame_range(8, 10).is_err());
        assert_eq!(ledger.version(), 0);
        assert!(ledger.removed_frames().is_empty());
    }

    #[test]
    fn test_add_frames_by_frequency() {
        let mut ledger = EditLedger::new(20);
        assert_eq!(ledger.add_frames_by_frequency(1, 10, 3).unwrap(), 4);
        assert_eq!(
            ledger.removed_frames().iter().copied().collect::<Vec<_>>(),
            vec![1, 4, 7, 10]
        );
        assert!(ledger.add_frames_by_frequency(0, 5, 0).is_err());
    }

    #[test]
    fn test_insert_frame_at_last_frame_rejected() {
        let mut ledger = EditLedger::new(4);
        let err = ledger.insert_frame(3, 0.5).unwrap_err();
        assert!(matches!(err, KineditError::InvalidFrameIndex { index: 3, .. }));
        assert!(ledger.insertions().is_empty());
        assert!(ledger.insert_frame(2, 0.5).is_ok());
    }

    #[test]
    fn test_insert_frame_rejects_factor_outside_open_interval() {
        let mut ledger = EditLedger::new(4);
        for factor in [0.0, 1.0, -0.1, 1.5, f64::NAN] {
            assert!(ledger.insert_frame(0, factor).is_err());
        }
        assert_eq!(ledger.version(), 0);
    }

    #[test]
    fn test_reinserting_replaces() {
        let mut ledger = EditLedger::new(4);
        ledger.insert_frame(1, 0.25).unwrap();
        ledger.insert_frame(1, 0.75).unwrap();
        assert_eq!(ledger.insertions().len(), 1);
        assert_eq!(ledger.insertions()[&1].interpolation_factor, 0.75);

        ledger.insert_frame_default(1).unwrap();
        assert_eq!(ledger.insertions()[&1].interpolation_factor, DEFAULT_INSERT_FACTOR);
    }

    #[test]
    fn test_adjustment_merges_partial_fields() {
        let mut ledger = EditLedger::new(4);
        ledger
            .set_trajectory_adjustment(
                1,
                TrajectoryAdjustment {
                    right_arm_delta: Some([0.1, 0.0, 0.0]),
                    ..Default::default()
                },
            )
            .unwrap();
        ledger
            .set_trajectory_adjustment(
                1,
                TrajectoryAdjustment {
                    right_gripper_override: Some(0.7),
                    ..Default::default()
                },
            )
            .unwrap();
        let adj = ledger.trajectory_adjustments()[&1];
        assert_eq!(adj.right_arm_delta, Some([0.1, 0.0, 0.0]));
        assert_eq!(adj.right_gripper_override, Some(0.7));
    }

    #[test]
    fn test_empty_adjustment_is_pruned() {
        let mut ledger = EditLedger::new(4);
        ledger
            .set_trajectory_adjustment(2, TrajectoryAdjustment::default())
            .unwrap();
        assert!(ledger.trajectory_adjustments().is_empty());
        assert_eq!(ledger.version(), 1);
    }

    #[test]
    fn test_camera_override_survives_clearing_global() {
        let mut ledger = EditLedger::new(4);
        let top = ImageTransform {
            color_filter: Some(ColorFilter::Invert),
            ..Default::default()
        };
        ledger.set_global_transform(Some(ImageTransform {
            color_filter: Some(ColorFilter::Grayscale),
            ..Default::default()
        }));
        ledger.set_camera_transform("top", Some(top.clone()));
        ledger.set_global_transform(None);
        assert_eq!(ledger.transforms().per_camera.get("top"), Some(&top));

        ledger.set_camera_transform("top", None);
        assert!(ledger.transforms().is_empty());
    }

    #[test]
    fn test_reset_clears_everything_and_bumps() {
        let mut ledger = EditLedger::new(6);
        ledger.toggle_frame_removal(0).unwrap();
        ledger.insert_frame(2, 0.5).unwrap();
        ledger.set_global_transform(Some(ImageTransform::default()));
        let before = ledger.version();
        ledger.reset();
        assert!(ledger.is_pristine());
        assert_eq!(ledger.version(), before + 1);
    }

    #[test]
    fn test_json_round_trip_and_validation() {
        let mut ledger = EditLedger::new(8);
        ledger.add_frame_range(1, 2).unwrap();
        ledger.insert_frame(4, 0.3).unwrap();
        let json = serde_json::to_string(&ledger).unwrap();
        let parsed: EditLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ledger);
        assert!(parsed.validate_for(8).is_ok());
        assert!(parsed.validate_for(9).is_err());
    }

    #[test]
    fn test_validate_rejects_hand_written_bad_anchor() {
        let raw = r#"{"frame_count":3,"insertions":{"2":{"interpolation_factor":0.5}}}"#;
        let parsed: EditLedger = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            parsed.validate_for(3),
            Err(KineditError::InvalidFrameIndex { index: 2, .. })
        ));
    }

    #[test]
    fn test_anchor_at_usize_max_is_rejected_not_overflowed() {
        let raw = format!(
            r#"{{"frame_count":3,"insertions":{{"{}":{{"interpolation_factor":0.5}}}}}}"#,
            usize::MAX
        );
        let parsed: EditLedger = serde_json::from_str(&raw).unwrap();
        assert!(matches!(
            parsed.validate_for(3),
            Err(KineditError::InvalidFrameIndex { index: usize::MAX, .. })
        ));

        let mut ledger = EditLedger::new(3);
        assert!(ledger.insert_frame(usize::MAX, 0.5).is_err());
        assert_eq!(ledger.version(), 0);
        assert!(!anchor_has_successor(0, 0));
        assert!(anchor_has_successor(1, 3));
        assert!(!anchor_has_successor(2, 3));
    }

    proptest! {
        #[test]
        fn prop_double_toggle_restores_removals(
            frame_count in 1usize..64,
            seed in proptest::collection::vec(0usize..64, 0..16),
            target in 0usize..64,
        ) {
            let mut ledger = EditLedger::new(frame_count);
            for i in seed.into_iter().filter(|i| *i < frame_count) {
                ledger.toggle_frame_removal(i).unwrap();
            }
            let target = target % frame_count;
            let before = ledger.removed_frames().clone();
            ledger.toggle_frame_removal(target).unwrap();
            ledger.toggle_frame_removal(target).unwrap();
            prop_assert_eq!(ledger.removed_frames(), &before);
        }

        #[test]
        fn prop_version_strictly_increases_on_success(
            ops in proptest::collection::vec((0usize..3, 0usize..20), 1..32),
        ) {
            let mut ledger = EditLedger::new(10);
            let mut last = ledger.version();
            for (op, index) in ops {
                let ok = match op {
                    0 => ledger.toggle_frame_removal(index).is_ok(),
                    1 => ledger.insert_frame(index, 0.5).is_ok(),
                    _ => ledger.add_frame_range(index / 2, index).is_ok(),
                };
                if ok {
                    prop_assert!(ledger.version() > last);
                } else {
                    prop_assert_eq!(ledger.version(), last);
                }
                last = ledger.version();
            }
        }
    }
}
