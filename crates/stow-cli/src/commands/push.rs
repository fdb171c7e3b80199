//! `stow push` command implementation.

use std::path::PathBuf;

use stow_client::PushOptions;
use stow_core::error::StowResult;

use super::CommandContext;

/// Archive `source` and push it as `reference`
pub async fn execute(source: PathBuf, reference: String, no_cache: bool, ctx: &CommandContext) -> StowResult<()> {
    let client = ctx.client()?;
    let mut options = PushOptions::default();
    if no_cache {
        options = options.bypass_cache(true);
    }

    let digest = client.push(&ctx.cancel, &source, &reference, options).await?;

    ctx.output.success(&format!("Pushed {} to {}", source.display(), reference));
    ctx.output.detail(&format!("digest: {}", digest));
    Ok(())
}
