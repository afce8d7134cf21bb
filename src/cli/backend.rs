//! Backend selection from CLI --backend flag.

use std::sync::Arc;

use crate::backend::{backend_for, select_backend, DeviceBackend, DeviceType};
use crate::error::MetricsError;

/// Resolve a device backend from the --backend CLI flag.
///
/// Accepted values: "auto" (default) or any device type name ("host",
/// "cuda", "npu" and their aliases).
pub fn resolve_backend(name: Option<&str>) -> Result<Arc<dyn DeviceBackend>, MetricsError> {
    match name.unwrap_or("auto") {
        "auto" => Ok(select_backend()),
        other => {
            let device_type: DeviceType = other.parse().map_err(|_| {
                MetricsError::InvalidConfig(format!(
                    "Unknown backend '{}'. Options: auto, host, cuda, npu",
                    other
                ))
            })?;
            backend_for(device_type)
        }
    }
}
