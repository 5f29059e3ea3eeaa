use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use subphot_core::reference::{NewReference, ReferenceKind, ReferenceManager};

use super::{ScopeArgs, StoreArgs};
use crate::summary;

#[derive(Args)]
pub struct ReferenceArgs {
    #[command(subcommand)]
    pub action: ReferenceAction,
}

#[derive(Subcommand)]
pub enum ReferenceAction {
    /// List current and superseded reference versions
    Show(ShowArgs),
    /// Install an existing image as the current reference
    Install(InstallArgs),
}

#[derive(Args)]
pub struct ShowArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Only this kind (astrometric or photometric)
    #[arg(long)]
    pub kind: Option<String>,
}

#[derive(Args)]
pub struct InstallArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Reference kind (astrometric or photometric)
    #[arg(long)]
    pub kind: String,

    /// Reference image
    pub file: PathBuf,
}

pub fn run(args: &ReferenceArgs) -> Result<()> {
    match &args.action {
        ReferenceAction::Show(show) => run_show(show),
        ReferenceAction::Install(install) => run_install(install),
    }
}

fn run_show(args: &ShowArgs) -> Result<()> {
    let scope = args.scope.scope()?;
    let (_, store) = args.store.open()?;
    let manager = ReferenceManager::new(store);

    let kinds = match args.kind {
        Some(ref kind) => vec![kind.parse::<ReferenceKind>()?],
        None => ReferenceKind::ALL.to_vec(),
    };
    let mut versions = Vec::new();
    for kind in kinds {
        versions.extend(manager.history(scope.project, scope.camera, scope.ccd, kind)?);
    }
    summary::print_references(&versions);
    Ok(())
}

fn run_install(args: &InstallArgs) -> Result<()> {
    let scope = args.scope.scope()?;
    let kind: ReferenceKind = args.kind.parse()?;
    if !args.file.is_file() {
        bail!("Reference image {} does not exist", args.file.display());
    }
    let path = args
        .file
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", args.file.display()))?;

    let (_, store) = args.store.open()?;
    let manager = ReferenceManager::new(store);
    let installed = manager.install(
        scope.project,
        scope.camera,
        scope.ccd,
        kind,
        &NewReference::new(path),
    )?;
    println!(
        "Installed {} reference #{} for {}",
        installed.kind, installed.id, scope
    );
    Ok(())
}
