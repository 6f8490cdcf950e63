//! The producer/applier replication pipeline (spec.md §4.3, §4.4).

mod applier;
mod producer;

pub use applier::Applier;
pub use producer::BackgroundSync;
