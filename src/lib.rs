pub mod checks;
pub mod config;
pub mod driver;
pub mod fixture;
#[cfg(feature = "gdal")]
pub mod gdal_driver;
pub mod logging;
pub mod rewrite;
pub mod scenario;
pub mod server;
pub mod suite;
pub mod wire;
