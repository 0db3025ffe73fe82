pub mod schema;
pub mod store;

pub use store::{InvocationRecord, IterationCounts, RunListing, Store};
