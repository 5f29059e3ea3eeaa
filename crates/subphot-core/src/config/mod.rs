pub mod layout;
pub mod params;
pub mod resolve;
pub mod toggles;

pub use layout::Layout;
pub use params::{
    Aperture, AstrometryParams, CommandTemplates, KernelSpec, PathsConfig, PhotometryParams,
    RunMode, RunParams, SubtractionParams,
};
pub use resolve::{prepare_directories, resolve, spacecraft_config, ResolvedConfig};
pub use toggles::{Toggle, ToggleSet};
