// mpas-engine: VM lifecycle, node-group scaling, dispatch, persistence.
// Depends on mpas-core and mpas-driver.

pub mod group;
pub mod node;
pub mod serve;
pub mod server;
pub mod snapshot;
