//! Closed-loop raster scanning for Thorlabs piezo stages over the APT
//! serial protocol.
//!
//! The crate drives a two-axis stage built from KPZ101 piezo controllers
//! and KSG101 strain gauge readers. Each axis converges on its target with
//! a software proportional loop; the scan orchestrator rasters the pair
//! over a grid, captures a measurement per cell and streams records to a
//! crash-safe CSV sink, under cooperative pause/resume/stop control.
//!
//! Entry points: [`scan::ScanOrchestrator`] for running scans,
//! [`instrument`] for the individual device drivers and
//! [`config::ScanConfig`] for loading a validated setup.

pub mod config;
pub mod error;
pub mod instrument;
pub mod measure;
pub mod protocol;
pub mod scan;
pub mod storage;
pub mod transport;
