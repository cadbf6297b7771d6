pub mod fault;
pub mod service;
pub mod version;

pub use service::{DatabaseProbe, DatabaseService};
pub use version::GreengageVersion;
