// mpas-cli: Clap command line, logging, startup
// Depends on mpas-core and mpas-engine.

pub mod commands;
pub mod logging;

pub use commands::run;
