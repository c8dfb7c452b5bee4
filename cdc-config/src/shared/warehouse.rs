use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

const fn default_max_connections() -> u32 {
    WarehouseConfig::DEFAULT_MAX_CONNECTIONS
}

/// Warehouse holding the changelog, replica, and merge cursor tables.
///
/// This intentionally does not implement [`serde::Serialize`] to avoid leaking secrets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseConfig {
    /// Process-local tables, lost on exit.
    Memory,
    /// Postgres database where datasets map to schemas.
    Postgres {
        connection: PgConnectionConfig,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
    /// Google BigQuery project where datasets map to BigQuery datasets.
    BigQuery {
        project_id: String,
        /// Path to a service account key file.
        service_account_key_path: String,
    },
}

impl WarehouseConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            WarehouseConfig::Postgres {
                max_connections, ..
            } if *max_connections == 0 => Err(ValidationError::InvalidFieldValue {
                field: "warehouse.postgres.max_connections".to_string(),
                constraint: "must be greater than 0".to_string(),
            }),
            WarehouseConfig::BigQuery { project_id, .. } if project_id.is_empty() => {
                Err(ValidationError::InvalidFieldValue {
                    field: "warehouse.big_query.project_id".to_string(),
                    constraint: "must not be empty".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Returns the project the run is billed to, when the warehouse has one.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            WarehouseConfig::BigQuery { project_id, .. } => Some(project_id),
            _ => None,
        }
    }
}
