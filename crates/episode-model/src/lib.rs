//! Kinedit Episode Model
//!
//! Defines the core data contracts for episode editing:
//! - **Episode:** the immutable recording (trajectory samples and camera frames)
//! - **Ledger:** sparse edits (removals, insertions, pose adjustments, transforms)
//! - **Transform:** per-camera image transform settings
//! - **Bundle:** the on-disk episode layout shared by loader and exporter
//!
//! Frame indices in the ledger always refer to original recorded frames.

pub mod bundle;
pub mod episode;
pub mod ledger;
pub mod transform;

pub use bundle::*;
pub use episode::*;
pub use ledger::*;
pub use transform::*;
