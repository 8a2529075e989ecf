//! CLI command implementations

pub mod config;
pub mod remote;
pub mod worktree;

pub use config::execute as config;
pub use remote::execute as remote;
pub use worktree::execute as delete_worktree;
