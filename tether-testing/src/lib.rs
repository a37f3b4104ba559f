//! Test support for the Tether transport: a UDP relay that drops,
//! duplicates and partitions traffic between a client and a server.

pub mod fault_injection;
pub mod relay;

pub use fault_injection::{Direction, FaultPlan};
pub use relay::{LossyRelay, RelayConditions, RelayStats};

/// Install a WARN-level fmt subscriber once per test binary.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
