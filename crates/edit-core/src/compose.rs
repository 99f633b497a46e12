//! Trajectory composition.
//!
//! Resolves the trajectory sample shown for an effective frame. Originals get
//! their pose adjustment applied; synthetic frames interpolate between two
//! already-adjusted originals, so editing an endpoint's delta carries through
//! to every synthetic frame that references it.

use std::collections::BTreeMap;

use kinedit_common::error::{KineditError, KineditResult};
use kinedit_episode_model::episode::{joints, JointVector, TrajectorySample, JOINT_COUNT};
use kinedit_episode_model::ledger::TrajectoryAdjustment;

use crate::reconcile::{EffectiveFrame, FrameOrigin};

/// Apply a pose adjustment to a position vector in place.
///
/// Deltas are added first; gripper overrides are assigned last, so an
/// override always wins and is never itself offset. Velocities are not
/// touched by adjustments.
pub fn apply_adjustment(positions: &mut JointVector, adjustment: &TrajectoryAdjustment) {
    if let Some(delta) = adjustment.right_arm_delta {
        for (slot, d) in positions[joints::RIGHT_ARM_XYZ].iter_mut().zip(delta) {
            *slot += d;
        }
    }
    if let Some(delta) = adjustment.left_arm_delta {
        for (slot, d) in positions[joints::LEFT_ARM_XYZ].iter_mut().zip(delta) {
            *slot += d;
        }
    }
    if let Some(value) = adjustment.right_gripper_override {
        positions[joints::RIGHT_GRIPPER] = value;
    }
    if let Some(value) = adjustment.left_gripper_override {
        positions[joints::LEFT_GRIPPER] = value;
    }
}

/// Recorded sample for `index` with its adjustment applied.
pub fn resolve_original(
    index: usize,
    trajectory: &[TrajectorySample],
    adjustments: &BTreeMap<usize, TrajectoryAdjustment>,
) -> KineditResult<TrajectorySample> {
    let mut sample = trajectory.get(index).cloned().ok_or_else(|| {
        KineditError::corrupt_source(format!(
            "no trajectory sample for frame {index} ({} recorded)",
            trajectory.len()
        ))
    })?;
    if let Some(adjustment) = adjustments.get(&index) {
        apply_adjustment(&mut sample.joint_positions, adjustment);
    }
    Ok(sample)
}

/// Component-wise `a * (1 - t) + b * t`.
pub fn lerp_joints(a: &JointVector, b: &JointVector, t: f64) -> JointVector {
    let mut out = [0.0; JOINT_COUNT];
    for (slot, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *slot = x * (1.0 - t) + y * t;
    }
    out
}

/// Resolve the sample for one effective frame.
///
/// Synthetic samples report the frame's effective index as `frame_index`,
/// since they have no recorded identity.
pub fn resolve_sample(
    frame: &EffectiveFrame,
    trajectory: &[TrajectorySample],
    adjustments: &BTreeMap<usize, TrajectoryAdjustment>,
) -> KineditResult<TrajectorySample> {
    match frame.origin {
        FrameOrigin::Original { source_frame_index } => {
            resolve_original(source_frame_index, trajectory, adjustments)
        }
        FrameOrigin::Synthetic {
            source_frame_index,
            next_source_frame_index,
            interpolation_factor: t,
        } => {
            let a = resolve_original(source_frame_index, trajectory, adjustments)?;
            let b = resolve_original(next_source_frame_index, trajectory, adjustments)?;
            Ok(TrajectorySample {
                frame_index: frame.effective_index,
                timestamp: a.timestamp * (1.0 - t) + b.timestamp * t,
                joint_positions: lerp_joints(&a.joint_positions, &b.joint_positions, t),
                joint_velocities: lerp_joints(&a.joint_velocities, &b.joint_velocities, t),
            })
        }
    }
}
