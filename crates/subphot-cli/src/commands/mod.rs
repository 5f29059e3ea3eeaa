pub mod config;
pub mod invalidate;
pub mod reference;
pub mod run;
pub mod status;
pub mod verify;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use subphot_core::config::{Layout, PathsConfig, RunMode, RunParams};
use subphot_core::frame::{Scope, Sector};
use subphot_core::store::Store;

/// (project, camera, ccd[, sector]) selection shared by maintenance commands.
#[derive(Args)]
pub struct ScopeArgs {
    /// Project id
    #[arg(long)]
    pub project: u32,

    /// Camera (1-4)
    #[arg(long)]
    pub camera: u8,

    /// CCD (1-4)
    #[arg(long)]
    pub ccd: u8,

    /// Sector or orbit label; every sector when omitted
    #[arg(long)]
    pub sector: Option<String>,
}

impl ScopeArgs {
    pub fn scope(&self) -> Result<Scope> {
        let scope = Scope::new(self.project, self.camera, self.ccd);
        match self.sector {
            Some(ref label) => {
                let sector: Sector = label
                    .parse()
                    .with_context(|| format!("Invalid sector '{label}'"))?;
                Ok(scope.with_sector(sector))
            }
            None => Ok(scope),
        }
    }
}

/// Where the working tree and registry live.
#[derive(Args)]
pub struct StoreArgs {
    /// Run parameter file (TOML) to take paths from
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root of the working tree
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Registry database file
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Work on the tuning-mode tree and registry even if the config file
    /// selects the full one
    #[arg(long)]
    pub tuning: bool,
}

impl StoreArgs {
    pub fn layout(&self) -> Result<Layout> {
        let (mut paths, configured) = match self.config {
            Some(ref path) => {
                let params = load_params(path)?;
                (params.paths, params.mode)
            }
            None => (PathsConfig::default(), RunMode::Full),
        };
        if let Some(ref base) = self.base_dir {
            paths.base_dir = base.clone();
        }
        if let Some(ref db) = self.database {
            paths.database = Some(db.clone());
        }
        let mode = if self.tuning {
            RunMode::Tuning
        } else {
            configured
        };
        Ok(Layout::from_paths(&paths, mode))
    }

    /// Open an existing registry.
    pub fn open(&self) -> Result<(Layout, Store)> {
        let layout = self.layout()?;
        if !layout.database.exists() {
            bail!("No registry at {}", layout.database.display());
        }
        let store = Store::open(&layout.database)
            .with_context(|| format!("Failed to open registry {}", layout.database.display()))?;
        Ok((layout, store))
    }
}

pub fn load_params(path: &Path) -> Result<RunParams> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&contents).context("Invalid run parameters")
}
