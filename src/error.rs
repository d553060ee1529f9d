//! Service-level error taxonomy.
//!
//! Every failure the orchestrator or executor can surface maps onto a small
//! set of kinds, each with a stable HTTP status code for the API layer.

use thiserror::Error;

use crate::device::DeviceKind;
use crate::protocol::ProtocolError;
use crate::storage_util::ConfigError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// No model mapping for the address or advertised name.
    #[error("{}", not_found_detail(.0))]
    DeviceNotFound(Option<DeviceKind>),
    /// The advertised name maps to a model this daemon cannot drive.
    #[error("Unsupported device type")]
    UnsupportedDevice,
    /// The address resolved to a different kind than the caller asked for.
    #[error("Device is not a {0}")]
    WrongKind(DeviceKind),
    /// No live connection for the requested kind.
    #[error("{} not connected", capitalized(.0))]
    NotConnected(DeviceKind),
    /// BLE connect or write failed against a known device.
    #[error("{} not reachable", capitalized(.0))]
    NotReachable(DeviceKind),
    /// The status-capture window elapsed without a notification.
    #[error("No status received from {0}")]
    NoStatusReceived(DeviceKind),
    /// Argument validation rejected the request before any side effect.
    #[error("{0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("configuration update failed: {0}")]
    ConfigUpdate(String),
    #[error("{0}")]
    Internal(String),
}

fn capitalized(kind: &DeviceKind) -> String {
    let name = kind.to_string();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => name,
    }
}

fn not_found_detail(kind: &Option<DeviceKind>) -> String {
    match kind {
        Some(kind) => format!("{} not found", capitalized(kind)),
        None => "Device not found".to_string(),
    }
}

impl ServiceError {
    /// HTTP status code for this error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::DeviceNotFound(_) | ServiceError::NotReachable(_) => 404,
            ServiceError::UnsupportedDevice
            | ServiceError::WrongKind(_)
            | ServiceError::NotConnected(_)
            | ServiceError::InvalidArgs(_) => 400,
            ServiceError::Protocol(ProtocolError::InvalidArgument(_)) => 400,
            ServiceError::NoStatusReceived(_)
            | ServiceError::Protocol(_)
            | ServiceError::ConfigUpdate(_)
            | ServiceError::Internal(_) => 500,
        }
    }

    /// Map a transport failure on a known device to the taxonomy.
    pub fn from_transport(err: TransportError, kind: DeviceKind) -> ServiceError {
        match err {
            TransportError::NotFound | TransportError::CharacteristicMissing(_) => {
                ServiceError::NotReachable(kind)
            }
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<ConfigError> for ServiceError {
    fn from(err: ConfigError) -> ServiceError {
        ServiceError::ConfigUpdate(err.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(ServiceError::DeviceNotFound(None).status_code(), 404);
        assert_eq!(
            ServiceError::NotReachable(DeviceKind::Doser).status_code(),
            404
        );
        assert_eq!(
            ServiceError::NotConnected(DeviceKind::Light).status_code(),
            400
        );
        assert_eq!(ServiceError::WrongKind(DeviceKind::Doser).status_code(), 400);
        assert_eq!(ServiceError::InvalidArgs("x".into()).status_code(), 400);
        assert_eq!(
            ServiceError::NoStatusReceived(DeviceKind::Doser).status_code(),
            500
        );
        assert_eq!(
            ServiceError::Protocol(ProtocolError::ChecksumCollision).status_code(),
            500
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ServiceError::WrongKind(DeviceKind::Doser).to_string(),
            "Device is not a doser"
        );
        assert_eq!(
            ServiceError::NotConnected(DeviceKind::Light).to_string(),
            "Light not connected"
        );
        assert_eq!(
            ServiceError::DeviceNotFound(Some(DeviceKind::Doser)).to_string(),
            "Doser not found"
        );
        assert_eq!(
            ServiceError::DeviceNotFound(None).to_string(),
            "Device not found"
        );
    }

    #[test]
    fn test_transport_mapping() {
        let err = ServiceError::from_transport(TransportError::NotFound, DeviceKind::Light);
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), "Light not reachable");
    }
}
