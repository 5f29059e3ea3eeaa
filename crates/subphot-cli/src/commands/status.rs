use anyhow::Result;
use clap::Args;
use subphot_core::reference::{ReferenceKind, ReferenceManager};
use subphot_core::registry::FrameRegistry;

use super::{ScopeArgs, StoreArgs};
use crate::summary;

#[derive(Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[command(flatten)]
    pub store: StoreArgs,
}

pub fn run(args: &StatusArgs) -> Result<()> {
    let scope = args.scope.scope()?;
    let (_, store) = args.store.open()?;
    let registry = FrameRegistry::new(store.clone());
    let references = ReferenceManager::new(store);

    let frames = registry.frames(&scope)?.len();
    let counts = registry.stage_counts(&scope)?;
    let snapshot = references.snapshot(&scope)?;
    let current: Vec<_> = ReferenceKind::ALL
        .into_iter()
        .filter_map(|kind| snapshot.get(kind).cloned())
        .collect();

    summary::print_status(&scope, frames, &counts, &current);
    Ok(())
}
