use thiserror::Error;

use crate::auth::AuthError;
use crate::checkout::CheckoutError;
use crate::config::ConfigError;
use crate::event::EventError;
use crate::store::StoreError;

/// RPC status classification shared by every component error. Clients branch
/// on this (or on the per-error `kind` tag), never on message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcCode {
    Unauthenticated,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Internal,
}

impl RpcCode {
    pub fn http_status(self) -> u16 {
        match self {
            RpcCode::Unauthenticated => 401,
            RpcCode::InvalidArgument => 400,
            RpcCode::NotFound => 404,
            RpcCode::FailedPrecondition => 412,
            RpcCode::Internal => 500,
        }
    }
}

/// Union of the component error enums. Components return their own enum;
/// this wrapper exists so the transport adapter can map any of them to a
/// response in one place.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Checkout(#[from] CheckoutError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Auth(err) => err.kind(),
            GatewayError::Event(err) => err.kind(),
            GatewayError::Store(err) => err.kind(),
            GatewayError::Checkout(err) => err.kind(),
            GatewayError::Config(err) => err.kind(),
        }
    }

    pub fn code(&self) -> RpcCode {
        match self {
            GatewayError::Auth(err) => err.code(),
            GatewayError::Event(err) => err.code(),
            GatewayError::Store(err) => err.code(),
            GatewayError::Checkout(err) => err.code(),
            GatewayError::Config(err) => err.code(),
        }
    }
}
