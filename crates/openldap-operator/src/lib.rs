//! # OpenLDAP Operator
//!
//! Supervises a single OpenLDAP workload paired with a PostgreSQL relation.
//! Every lifecycle trigger runs the same reconciliation: decide the unit
//! status and, on the leader, assemble and apply the pod spec.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod kubernetes;
pub mod manager;
pub mod password;
pub mod pebble;
pub mod podspec;
pub mod reconciler;
pub mod state;
pub mod status;
pub mod workload;

pub use config::*;
pub use controller::*;
pub use error::*;
pub use events::*;
pub use manager::*;
pub use podspec::*;
pub use reconciler::*;
pub use state::*;
pub use status::*;
pub use workload::*;

/// Logical database requested from the PostgreSQL relation
pub const DATABASE_NAME: &str = "openldap";

/// Name of the workload container and service
pub const WORKLOAD_NAME: &str = "openldap";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_and_workload_names() {
        assert_eq!(DATABASE_NAME, "openldap");
        assert_eq!(WORKLOAD_NAME, "openldap");
    }
}
