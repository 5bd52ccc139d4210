// mpas-driver: Stateless subprocess façades over the host tools.
// Depends only on mpas-core.

pub mod kubectl;
pub mod multipass;
pub mod shell;
#[cfg(any(test, feature = "mock-shell"))]
pub mod shell_mock;
