//! RPC errors and the mapping between registry errors and gRPC status.

use std::net::SocketAddr;

use armada_registry::RegistryError;
use thiserror::Error;
use tonic::{Code, Status};

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("invalid endpoint {0}")]
    Endpoint(String),
}

/// Server side: registry error to wire status.
pub fn to_status(err: RegistryError) -> Status {
    match err {
        RegistryError::NotFound(m) => Status::not_found(m),
        RegistryError::AlreadyExists(m) => Status::already_exists(m),
        RegistryError::Conflict(m) => Status::aborted(m),
        RegistryError::Precondition(m) => Status::failed_precondition(m),
        RegistryError::Transient(m) => Status::unavailable(m),
        RegistryError::Invalid(m) => Status::invalid_argument(m),
        RegistryError::Fatal(m) => Status::internal(m),
    }
}

/// Client side: wire status back to a registry error.
pub fn from_status(status: Status) -> RegistryError {
    let message = status.message().to_string();
    match status.code() {
        Code::NotFound => RegistryError::NotFound(message),
        Code::AlreadyExists => RegistryError::AlreadyExists(message),
        Code::Aborted => RegistryError::Conflict(message),
        Code::FailedPrecondition => RegistryError::Precondition(message),
        Code::InvalidArgument => RegistryError::Invalid(message),
        Code::Internal | Code::DataLoss => RegistryError::Fatal(message),
        _ => RegistryError::Transient(format!("{:?}: {message}", status.code())),
    }
}

/// Whether a failed call says the connection itself is unusable.
pub fn is_transport_failure(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::Unknown | Code::Cancelled
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_survive_the_wire() {
        let errors = [
            RegistryError::NotFound("a".into()),
            RegistryError::AlreadyExists("a".into()),
            RegistryError::Conflict("a".into()),
            RegistryError::Precondition("a".into()),
            RegistryError::Invalid("a".into()),
            RegistryError::Fatal("a".into()),
        ];
        for err in errors {
            assert_eq!(from_status(to_status(err.clone())), err);
        }
    }

    #[test]
    fn transport_codes_become_transient() {
        let err = from_status(Status::unavailable("connection refused"));
        assert!(err.is_retryable());
        assert!(is_transport_failure(&Status::deadline_exceeded("slow")));
        assert!(!is_transport_failure(&Status::not_found("x")));
    }
}
