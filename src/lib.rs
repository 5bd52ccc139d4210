//! # mpas — cluster-autoscaler cloud provider for Multipass VMs
//!
//! Facade crate that re-exports the mpas workspace crates so consumers
//! can depend on a single `mpas` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | mpas-core | Types, config, errors, provider-ID codec, wire protocol |
//! | [`driver`] | mpas-driver | Shell execution, multipass and kubectl façades |
//! | [`engine`] | mpas-engine | Node lifecycle, scaling engine, dispatch, snapshots |
//! | [`cli`] | mpas-cli | Command line, logging, startup |

pub use mpas_cli as cli;
pub use mpas_core as core;
pub use mpas_driver as driver;
pub use mpas_engine as engine;
