//! remake - compute-on-demand special remote for git-annex
//!
//! Annexed files whose content can be recomputed carry a `remake:` address
//! naming a signed recipe. Retrieving such a file checks out the recorded
//! inputs in a disposable worktree, runs the recipe and hands the result to
//! git-annex, reinjecting sibling outputs along the way.

pub mod address;
pub mod cli;
pub mod collect;
pub mod config;
pub mod error;
pub mod events;
pub mod execute;
pub mod pattern;
pub mod pipeline;
pub mod protocol;
pub mod recipe;
pub mod store;
pub mod trust;
pub mod worktree;

pub use error::{RemakeError, RemakeResult};
