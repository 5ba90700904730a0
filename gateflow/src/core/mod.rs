//! Pure pipeline logic: no filesystem, process, or clock access beyond
//! [`types::now`].

pub mod analysis;
pub mod contract;
pub mod errors;
pub mod patch;
pub mod router;
pub mod status;
pub mod telemetry;
pub mod types;
