//! Kinedit Edit Core
//!
//! Derives the edited view of an episode from its edit ledger:
//! - **Reconciliation:** removals and insertions become an ordered effective frame sequence
//! - **Composition:** per-frame trajectory samples with pose adjustments and interpolation
//! - **Image pipeline:** crop, resize, colour adjustment and filters per camera
//!
//! This crate is pure computation over already-loaded episodes. The only
//! state is the memoized effective sequence held by [`EditSession`].

pub mod compose;
pub mod image_pipeline;
pub mod reconcile;
pub mod session;

pub use reconcile::{EffectiveFrame, EffectiveSubtask, FrameOrigin};
pub use session::EditSession;
