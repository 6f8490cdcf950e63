//! Sharded chunk migration: donor and recipient cooperate through a
//! side-log and a config registry CAS commit (spec.md §4.9, §4.10).

mod donor;
mod recipient;
mod registry;
mod sidelog;

pub use donor::MigrationDonor;
pub use recipient::MigrationRecipient;
pub use registry::{ConfigRegistry, InMemoryConfigRegistry};
pub use sidelog::MigrateSideLog;
