//! Stochastic Petri net stations.
//!
//! A place is a [`Storage`] input, a pass-through service and a [`Linkage`]
//! output; a transition is an [`Enabling`] input, a [`Timing`] service and a
//! [`Firing`] output. Both kinds exchange ordinary jobs with the rest of the
//! network, so places and queueing stations can be mixed freely.

mod enabling;
mod firing;
mod linkage;
mod matrix;
mod storage;
mod timing;

pub use enabling::Enabling;
pub use firing::Firing;
pub use linkage::Linkage;
pub use matrix::{ModeSpec, TransitionMatrix, enabling_degree};
pub use storage::{Storage, StorageConfig, StorageRule};
pub use timing::Timing;
