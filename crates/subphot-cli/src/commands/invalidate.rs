use std::collections::BTreeSet;

use anyhow::{bail, Result};
use clap::Args;
use subphot_core::invalidate::{Invalidator, Layer};
use subphot_core::reference::ReferenceManager;
use subphot_core::registry::FrameRegistry;

use super::{ScopeArgs, StoreArgs};
use crate::summary;

#[derive(Args)]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Layers to drop: calibration, alignment, subtraction, photometry,
    /// lightcurves, reference-frames, frame-info-cache
    #[arg(long = "layer", value_delimiter = ',', required = true)]
    pub layers: Vec<String>,

    /// Confirm that no batch is running on this scope
    #[arg(long)]
    pub yes: bool,
}

pub fn run(args: &InvalidateArgs) -> Result<()> {
    let scope = args.scope.scope()?;
    let layers = args
        .layers
        .iter()
        .map(|name| name.parse::<Layer>())
        .collect::<Result<BTreeSet<_>, _>>()?;

    if !args.yes {
        bail!(
            "Invalidation needs exclusive access to {scope}: make sure no run is active on it, \
             then repeat with --yes"
        );
    }

    let (layout, store) = args.store.open()?;
    let invalidator = Invalidator::new(
        layout,
        FrameRegistry::new(store.clone()),
        ReferenceManager::new(store),
    );
    let report = invalidator.invalidate(&scope, &layers)?;
    summary::print_invalidation(&scope, &report);
    Ok(())
}
