//! Common error type for the control-plane services.

use crate::driver::DriverError;
use snafu::Snafu;
use store_api::StoreError;
use uuid::Uuid;

/// Common error type for the services
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
#[allow(missing_docs)]
pub enum SvcError {
    #[snafu(display("Store request failed"))]
    Store { source: StoreError },
    #[snafu(display("Driver request '{}' for pool '{}' failed with '{}'", request, pool, source))]
    DriverRequest {
        pool: Uuid,
        request: &'static str,
        source: DriverError,
    },
    #[snafu(display("No driver registered under name '{}'", name))]
    DriverNotFound { name: String },
    #[snafu(display("Pool '{}' has no usable driver spec", pool))]
    InvalidDriverSpec { pool: Uuid },
    #[snafu(display("Pool '{}' not found", pool))]
    PoolNotFound { pool: Uuid },
    #[snafu(display("Node '{}' not found", node))]
    NodeNotFound { node: Uuid },
    #[snafu(display("Machine '{}' not found", machine))]
    MachineNotFound { machine: Uuid },
    #[snafu(display("Root volume not found for machine '{}'", machine))]
    RootVolumeNotFound { machine: Uuid },
    #[snafu(display("Pool '{}' does not have enough resources", pool))]
    NotEnoughResources { pool: Uuid },
    #[snafu(display("Invalid resource payload for '{}/{}'", kind, uuid))]
    InvalidPayload {
        kind: String,
        uuid: Uuid,
        source: serde_json::Error,
    },
    #[snafu(display("Work directory error: {}", details))]
    WorkDir {
        details: String,
        source: std::io::Error,
    },
    #[snafu(display("Internal error: {}", details))]
    Internal { details: String },
}

impl From<StoreError> for SvcError {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}
