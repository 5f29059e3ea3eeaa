use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use subphot_core::config::{prepare_directories, resolve, RunMode, RunParams, ToggleSet};
use subphot_core::pipeline::{discover_frames, CommandProcessor, StageCoordinator, WorkerPool};
use subphot_core::reference::ReferenceManager;
use subphot_core::registry::FrameRegistry;
use subphot_core::store::Store;

use crate::progress::BarReporter;
use crate::summary;

#[derive(Args)]
pub struct RunArgs {
    /// Run parameter file (TOML); flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Project id
    #[arg(long)]
    pub project: Option<u32>,

    /// Sector or orbit label (s0001, sector-1, orbit-9)
    #[arg(long)]
    pub sector: Option<String>,

    /// Camera (1-4)
    #[arg(long)]
    pub camera: Option<u8>,

    /// CCD (1-4)
    #[arg(long)]
    pub ccd: Option<u8>,

    /// Tuning mode: process a frame sample with few workers
    #[arg(long)]
    pub tuning: bool,

    /// Number of concurrent stage workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Photometric apertures as radius:annulus_inner:annulus_width,...
    #[arg(long)]
    pub apertures: Option<String>,

    /// Convolution kernel specification, e.g. "b/4;i/4;d=4/4"
    #[arg(long)]
    pub kernel: Option<String>,

    /// Comma-separated toggles (reverse-subtract, skip-detrend, ...)
    #[arg(long)]
    pub toggles: Option<String>,

    /// Root of the working tree
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Directory holding the input frames
    #[arg(long)]
    pub raw_dir: Option<PathBuf>,

    /// Registry database file
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Resolve and list the work without dispatching anything
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(args: &RunArgs) -> Result<()> {
    let params = build_params(args)?;
    let config = resolve(&params).context("Invalid run configuration")?;
    summary::print_run_summary(&config);

    let frames = discover_frames(&config)?;
    if frames.is_empty() {
        println!("No frames match {}", config.input_glob);
        return Ok(());
    }
    println!("  {} frame(s) selected", frames.len());

    let processor = CommandProcessor::new(&config);
    let missing = processor.missing_templates(&config.graph().sequence());
    if !missing.is_empty() {
        summary::print_missing_templates(&missing);
    }

    if args.dry_run {
        return Ok(());
    }

    prepare_directories(&config)?;
    let store = Store::open(&config.layout.database).with_context(|| {
        format!("Failed to open registry {}", config.layout.database.display())
    })?;
    let pool = WorkerPool::new(config.workers)?;
    let coordinator = StageCoordinator::new(
        FrameRegistry::new(store.clone()),
        ReferenceManager::new(store),
        config,
    );

    let reporter = Arc::new(BarReporter::new());
    let report = coordinator.run_batch_reported(&frames, &processor, &pool, reporter)?;
    summary::print_batch_report(&report);
    Ok(())
}

fn build_params(args: &RunArgs) -> Result<RunParams> {
    let mut params = match args.config {
        Some(ref path) => super::load_params(path)?,
        None => {
            let (Some(project), Some(sector), Some(camera), Some(ccd)) =
                (args.project, args.sector.as_ref(), args.camera, args.ccd)
            else {
                bail!("--project, --sector, --camera and --ccd are required without --config");
            };
            RunParams::new(project, sector.clone(), camera, ccd)
        }
    };

    if let Some(project) = args.project {
        params.project = project;
    }
    if let Some(ref sector) = args.sector {
        params.sector = sector.clone();
    }
    if let Some(camera) = args.camera {
        params.camera = camera;
    }
    if let Some(ccd) = args.ccd {
        params.ccd = ccd;
    }
    if args.tuning {
        params.mode = RunMode::Tuning;
    }
    if args.workers.is_some() {
        params.workers = args.workers;
    }
    if let Some(ref apertures) = args.apertures {
        params.photometry.apertures = apertures.clone();
    }
    if let Some(ref kernel) = args.kernel {
        params.subtraction.kernel_spec = kernel.clone();
    }
    if let Some(ref toggles) = args.toggles {
        params.toggles = ToggleSet::parse_list(toggles)?;
    }
    if let Some(ref base) = args.base_dir {
        params.paths.base_dir = base.clone();
    }
    if let Some(ref raw) = args.raw_dir {
        params.paths.raw_dir = Some(raw.clone());
    }
    if let Some(ref db) = args.database {
        params.paths.database = Some(db.clone());
    }
    Ok(params)
}
