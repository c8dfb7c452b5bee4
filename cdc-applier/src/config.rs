use cdc_config::load_config;
use cdc_config::shared::ServiceConfig;

use crate::error::{ApplierError, ApplierResult};

/// Loads the service configuration and validates it before anything starts.
pub fn load_service_config() -> ApplierResult<ServiceConfig> {
    let config = load_config::<ServiceConfig>().map_err(ApplierError::config)?;
    config.validate().map_err(ApplierError::config)?;

    Ok(config)
}
