//! `stow pull` command implementation.

use std::path::PathBuf;

use stow_cache::format_bytes;
use stow_client::PullOptions;
use stow_core::error::StowResult;

use super::{extract_limits, CommandContext};

/// Pull `reference` into `target`, through the cache unless `no_cache`
pub async fn execute(
    reference: String,
    target: PathBuf,
    no_cache: bool,
    strip_prefix: Option<PathBuf>,
    ctx: &CommandContext,
) -> StowResult<()> {
    let client = ctx.client()?;

    let mut options = PullOptions::default();
    if no_cache {
        options = options.bypass_cache(true);
    }
    if let Some(prefix) = strip_prefix {
        let mut limits = extract_limits(&ctx.config.pull);
        limits.strip_prefix = Some(prefix);
        options = options.limits(limits);
    }

    let report = client.pull_with_cache(&ctx.cancel, &reference, &target, options).await?;

    let origin = if report.from_cache { "cache" } else { "registry" };
    ctx.output
        .success(&format!("Pulled {} into {} from {}", reference, target.display(), origin));
    ctx.output
        .detail(&format!("{} files, {}", report.files, format_bytes(report.bytes)));
    ctx.output.detail(&format!("digest: {}", report.digest));
    Ok(())
}
