//! Delete-worktree command - recover from interrupted retrievals

use crate::cli::args::DeleteWorktreeArgs;
use crate::error::RemakeResult;
use crate::worktree::delete_worktree;
use console::style;

/// Execute the delete-worktree command
pub async fn execute(args: DeleteWorktreeArgs) -> RemakeResult<()> {
    delete_worktree(&args.path).await?;
    println!(
        "{} Deleted worktree {}",
        style("✓").green(),
        style(args.path.display()).dim()
    );
    Ok(())
}
