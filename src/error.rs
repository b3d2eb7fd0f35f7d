use crate::lifecycle::{Actor, Transition};
use crate::order::OrderStatus;

#[derive(thiserror::Error, Debug)]
pub enum OrderError {
    #[error("Authentication required: {0}")]
    Unauthorized(String),
    #[error("Access denied: {0}")]
    Forbidden(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{0}")]
    InvalidState(String),
    #[error(
        "Insufficient stock for {product_id} ({color}/{size}): requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: String,
        color: String,
        size: String,
        requested: u32,
        available: u32,
    },
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("Record encoding failure: {0}")]
    Codec(String),
}

/// Raised when a status change is not an edge of the order lifecycle graph.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot apply {transition:?} to a {from} order as {actor:?}")]
pub struct TransitionError {
    pub from: OrderStatus,
    pub transition: Transition,
    pub actor: Actor,
}

impl OrderError {
    pub fn order_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "Order",
            id: id.to_string(),
        }
    }
    pub fn product_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "Product",
            id: id.to_string(),
        }
    }

    /// Machine readable code surfaced on admin routes.
    pub fn code(&self) -> &'static str {
        match self {
            OrderError::Unauthorized(_) => "UNAUTHORIZED",
            OrderError::Forbidden(_) => "FORBIDDEN",
            OrderError::NotFound { .. } => "NOT_FOUND",
            OrderError::InvalidState(_) => "INVALID_STATE",
            OrderError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            OrderError::Validation(_) => "VALIDATION_ERROR",
            OrderError::Storage(_) => "STORAGE_ERROR",
            OrderError::Codec(_) => "CODEC_ERROR",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            OrderError::Unauthorized(_) => 401,
            OrderError::Forbidden(_) => 403,
            OrderError::NotFound { .. } => 404,
            OrderError::InvalidState(_) => 409,
            OrderError::InsufficientStock { .. } => 409,
            OrderError::Validation(_) => 400,
            OrderError::Storage(_) | OrderError::Codec(_) => 500,
        }
    }
}

impl From<TransitionError> for OrderError {
    fn from(value: TransitionError) -> Self {
        OrderError::InvalidState(value.to_string())
    }
}

impl From<sled::transaction::TransactionError<OrderError>> for OrderError {
    fn from(value: sled::transaction::TransactionError<OrderError>) -> Self {
        match value {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => OrderError::Storage(e),
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for OrderError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        OrderError::Codec(value.to_string())
    }
}

impl From<minicbor::decode::Error> for OrderError {
    fn from(value: minicbor::decode::Error) -> Self {
        OrderError::Codec(value.to_string())
    }
}
