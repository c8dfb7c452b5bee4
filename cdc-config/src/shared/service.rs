use serde::Deserialize;

use crate::Config;
use crate::shared::{ApplierConfig, TransportConfig, ValidationError, WarehouseConfig};

/// Root configuration of the change applier service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub applier: ApplierConfig,
    pub warehouse: WarehouseConfig,
    pub transport: TransportConfig,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.applier.validate()?;
        self.warehouse.validate()?;
        self.transport.validate()
    }
}

impl Config for ServiceConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] =
        &["applier.input_topics", "applier.input_subscriptions"];
}
