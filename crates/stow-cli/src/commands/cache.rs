//! `stow cache` command implementation.

use stow_cache::{format_bytes, Cache};
use stow_core::error::StowResult;

use super::CommandContext;
use crate::CacheAction;

pub async fn execute(action: CacheAction, ctx: &CommandContext) -> StowResult<()> {
    let cache = ctx.open_cache()?;
    let root = cache.root().display().to_string();

    match action {
        CacheAction::Size => {
            let size = cache.size().await?;
            let stats = cache.stats();
            ctx.output.info(&format!(
                "{} used of {} ({} bundles, {} blobs)",
                format_bytes(size),
                format_bytes(stats.max_bytes),
                stats.manifests,
                stats.blobs
            ));
            ctx.output.detail(&root);
        }
        CacheAction::Clear => {
            cache.clear().await?;
            ctx.output.success(&format!("Cleared cache at {}", root));
        }
        CacheAction::Prune => {
            let result = cache.prune_expired().await?;
            ctx.output.success(&format!(
                "Removed {} expired entries, freed {}",
                result.entries_removed,
                result.format_freed_space()
            ));
        }
    }
    Ok(())
}
