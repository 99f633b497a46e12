//! Frame index reconciliation.
//!
//! Turns an original frame count plus the removal and insertion edits into
//! the ordered effective frame sequence that playback and export walk.
//! Everything here is a pure function of its inputs and never fails: the
//! ledger validates indices when edits are made, and anything out of range
//! that still reaches this module is ignored.

use std::collections::{BTreeMap, BTreeSet};

use kinedit_episode_model::episode::SubtaskSpan;
use kinedit_episode_model::ledger::{anchor_has_successor, Insertion};
use serde::{Deserialize, Serialize};

/// Where an effective frame comes from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameOrigin {
    /// A recorded frame, shown as-is (plus pose adjustments).
    Original { source_frame_index: usize },

    /// An inserted frame interpolated between two recorded neighbours.
    Synthetic {
        source_frame_index: usize,
        next_source_frame_index: usize,
        interpolation_factor: f64,
    },
}

/// One entry of the effective sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveFrame {
    /// Position in the effective sequence.
    pub effective_index: usize,

    #[serde(flatten)]
    pub origin: FrameOrigin,
}

impl EffectiveFrame {
    /// The original frame whose image (and, for originals, sample) this frame uses.
    pub fn source_frame_index(&self) -> usize {
        match self.origin {
            FrameOrigin::Original { source_frame_index }
            | FrameOrigin::Synthetic {
                source_frame_index, ..
            } => source_frame_index,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.origin, FrameOrigin::Synthetic { .. })
    }
}

/// Whether an insertion at `anchor` shows up in the effective sequence.
///
/// Insertions anchored on a removed frame, or pointing at a removed
/// successor, stay in the ledger but are skipped until the removal is undone.
pub fn insertion_is_active(
    anchor: usize,
    frame_count: usize,
    removed: &BTreeSet<usize>,
) -> bool {
    anchor_has_successor(anchor, frame_count)
        && !removed.contains(&anchor)
        && !removed.contains(&(anchor + 1))
}

/// Build the effective frame sequence.
pub fn reconcile(
    frame_count: usize,
    removed: &BTreeSet<usize>,
    insertions: &BTreeMap<usize, Insertion>,
) -> Vec<EffectiveFrame> {
    let mut frames = Vec::with_capacity(effective_frame_count(frame_count, removed, insertions));

    for index in 0..frame_count {
        if removed.contains(&index) {
            continue;
        }

        frames.push(EffectiveFrame {
            effective_index: frames.len(),
            origin: FrameOrigin::Original {
                source_frame_index: index,
            },
        });

        let Some(insertion) = insertions.get(&index) else {
            continue;
        };
        if insertion_is_active(index, frame_count, removed) {
            frames.push(EffectiveFrame {
                effective_index: frames.len(),
                origin: FrameOrigin::Synthetic {
                    source_frame_index: index,
                    next_source_frame_index: index + 1,
                    interpolation_factor: insertion.interpolation_factor,
                },
            });
        }
    }

    frames
}

/// Length of [`reconcile`]'s output, computed without building it.
pub fn effective_frame_count(
    frame_count: usize,
    removed: &BTreeSet<usize>,
    insertions: &BTreeMap<usize, Insertion>,
) -> usize {
    let kept = frame_count - removed.range(..frame_count).count();
    let inserted = insertions
        .keys()
        .filter(|anchor| insertion_is_active(**anchor, frame_count, removed))
        .count();
    kept + inserted
}

/// Map each surviving original frame to its effective index.
///
/// The result is indexed by original frame; removed frames map to `None`.
pub fn source_to_effective(frames: &[EffectiveFrame], frame_count: usize) -> Vec<Option<usize>> {
    let mut map = vec![None; frame_count];
    for frame in frames {
        if let FrameOrigin::Original { source_frame_index } = frame.origin {
            if let Some(slot) = map.get_mut(source_frame_index) {
                *slot = Some(frame.effective_index);
            }
        }
    }
    map
}

/// A subtask span expressed in effective indices (inclusive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveSubtask {
    pub label: String,
    pub start_index: usize,
    pub end_index: usize,
}

/// Re-express subtask spans in the effective sequence.
///
/// A span covers every effective frame whose source frame lies inside it,
/// synthetic frames anchored inside included. Spans whose frames were all
/// removed are dropped.
pub fn remap_subtasks(frames: &[EffectiveFrame], spans: &[SubtaskSpan]) -> Vec<EffectiveSubtask> {
    spans
        .iter()
        .filter_map(|span| {
            let inside = |frame: &&EffectiveFrame| {
                let source = frame.source_frame_index();
                source >= span.start_frame && source <= span.end_frame
            };
            let first = frames.iter().find(inside)?;
            let last = frames.iter().rev().find(inside)?;
            Some(EffectiveSubtask {
                label: span.label.clone(),
                start_index: first.effective_index,
                end_index: last.effective_index,
            })
        })
        .collect()
}
