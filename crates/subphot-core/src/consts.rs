/// Default number of concurrent stage workers for a full run.
pub const DEFAULT_WORKERS: usize = 32;

/// Upper bound on workers in tuning mode.
pub const TUNING_MAX_WORKERS: usize = 4;

/// Default number of frames sampled from the input set in tuning mode.
pub const DEFAULT_TUNING_SAMPLE: usize = 50;

/// Default convolution kernel specification for image differencing.
/// Background, identity and discrete terms, each with a spatial order.
pub const DEFAULT_KERNEL_SPEC: &str = "b/4;i/4;d=4/4";

/// Default photometric apertures as `radius:annulus_inner:annulus_width`.
pub const DEFAULT_APERTURES: &str = "1.95:7.0:6.0,2.45:7.0:6.0,2.95:7.0:6.0";

/// Flux above which a residual in a subtracted frame counts as a new source.
pub const DEFAULT_FLUX_THRESHOLD: f64 = 1000.0;

/// Catalog cross-match radius for new-source detection, in arcseconds.
pub const DEFAULT_CATMATCH_ARCSEC: f64 = 3.0;

/// Maximum residual (pixels) accepted when matching a frame to the astrometric reference.
pub const DEFAULT_MATCH_MAX_DISTANCE: f64 = 1.0;

/// Polynomial order of the frame-to-reference transformation.
pub const DEFAULT_TRANSFORM_ORDER: u32 = 4;

/// Maximum number of sources fed to the triangulation matcher.
pub const DEFAULT_MATCH_MAX_SOURCES: u32 = 5000;

/// Each reference-selection ranking is truncated to this many frames before
/// the rankings are intersected.
pub const REFERENCE_RANK_DEPTH: usize = 200;

/// Minimum number of frames passing the photometric-reference criteria.
pub const DEFAULT_PHOTREF_MIN_FRAMES: usize = 50;

/// Number of frames stacked into the photometric reference.
pub const DEFAULT_PHOTREF_MAX_CANDIDATES: usize = 50;

/// Default upper bound on the per-frame background standard deviation for
/// photometric-reference candidates.
pub const DEFAULT_PHOTREF_MAX_BACKGROUND_STDEV: f64 = 10.0;

/// Default upper bound on the per-frame background median for
/// photometric-reference candidates.
pub const DEFAULT_PHOTREF_MAX_BACKGROUND_MEDIAN: f64 = 1000.0;

/// Frames fetched per registry round-trip when iterating pending work.
pub const PENDING_PAGE_SIZE: usize = 256;

/// Upper bound on coordinator passes over the stage sequence in one batch.
pub const MAX_COORDINATOR_PASSES: usize = 4;
