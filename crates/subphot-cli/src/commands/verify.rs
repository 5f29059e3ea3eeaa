use anyhow::{bail, Result};
use clap::Args;
use subphot_core::registry::FrameRegistry;

use super::{ScopeArgs, StoreArgs};
use crate::summary;

#[derive(Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Exits with an error if any orphaned record is found.
pub fn run(args: &VerifyArgs) -> Result<()> {
    let scope = args.scope.scope()?;
    let (_, store) = args.store.open()?;
    let orphans = FrameRegistry::new(store).orphans(&scope)?;

    summary::print_orphans(&scope, &orphans);
    if !orphans.is_empty() {
        bail!("{} orphaned record(s) in {scope}", orphans.len());
    }
    Ok(())
}
