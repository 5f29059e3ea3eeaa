pub mod config;
pub mod consts;
pub mod error;
pub mod frame;
pub mod invalidate;
pub mod pipeline;
pub mod reference;
pub mod registry;
pub mod store;
