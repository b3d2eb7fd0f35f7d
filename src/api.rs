//! Request-level entry points for the order endpoints
//!
//! | route                                      | method                           |
//! |--------------------------------------------|----------------------------------|
//! | `POST /orders`                             | [`OrderApi::create_order`]       |
//! | `PUT /orders?id=`                          | [`OrderApi::update_order`]       |
//! | `PUT /admin/orders?id=`                    | [`OrderApi::admin_update_order`] |
//! | `POST /admin/orders/{id}/cancel-approval`  | [`OrderApi::cancel_approval`]    |
//! | `DELETE /admin/orders/{id}`                | [`OrderApi::admin_archive_order`]|
//!
//! Each call takes the raw `Authorization` header. Customer routes report
//! only an error message, admin routes add a machine readable code.
use super::auth::{Claims, TokenVerifier, bearer_token};
use super::error::OrderError;
use super::order::{Order, OrderStatus};
use super::service::{
    CancellationDecision, CancellationOutcome, NewOrder, OrderReceipt, OrderService, StatusUpdate,
};
use std::sync::Arc;
use tracing::warn;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub code: Option<&'static str>,
    pub message: String,
}

impl ApiError {
    fn customer(err: OrderError) -> Self {
        Self {
            status: err.status(),
            code: None,
            message: err.to_string(),
        }
    }

    fn admin(err: OrderError) -> Self {
        Self {
            status: err.status(),
            code: Some(err.code()),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOrderRequest {
    pub status: String,
    pub tracking_number: Option<String>,
    pub cancellation_reason: Option<String>,
    pub note: Option<String>,
}

impl TryFrom<UpdateOrderRequest> for StatusUpdate {
    type Error = OrderError;

    fn try_from(request: UpdateOrderRequest) -> Result<Self, Self::Error> {
        Ok(StatusUpdate {
            status: Some(request.status.parse::<OrderStatus>()?),
            tracking_number: request.tracking_number,
            cancellation_reason: request.cancellation_reason,
            note: request.note,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelApprovalRequest {
    /// `approve` or `reject`
    pub action: String,
    pub admin_note: Option<String>,
}

fn parse_decision(action: &str) -> Result<CancellationDecision, OrderError> {
    match action.trim().to_ascii_lowercase().as_str() {
        "approve" => Ok(CancellationDecision::Approve),
        "reject" => Ok(CancellationDecision::Reject),
        other => Err(OrderError::Validation(format!(
            "action must be 'approve' or 'reject', got '{other}'"
        ))),
    }
}

fn require_id(id: Option<&str>) -> Result<&str, OrderError> {
    id.map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| OrderError::Validation("order id is required".into()))
}

pub struct OrderApi {
    service: Arc<OrderService>,
    verifier: Arc<dyn TokenVerifier>,
}

impl OrderApi {
    pub fn new(service: Arc<OrderService>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { service, verifier }
    }

    pub fn service(&self) -> &Arc<OrderService> {
        &self.service
    }

    fn authenticate(&self, authorization: Option<&str>) -> Result<Claims, OrderError> {
        let token = bearer_token(authorization)?;
        self.verifier.verify(token).map_err(|e| {
            warn!(error = %e, "Rejected bearer token");
            OrderError::Unauthorized("invalid or expired token".into())
        })
    }

    pub fn create_order(
        &self,
        authorization: Option<&str>,
        request: NewOrder,
    ) -> Result<OrderReceipt, ApiError> {
        let claims = self.authenticate(authorization).map_err(ApiError::customer)?;
        self.service
            .create_order(&claims, request)
            .map_err(ApiError::customer)
    }

    pub fn update_order(
        &self,
        authorization: Option<&str>,
        id: Option<&str>,
        request: UpdateOrderRequest,
    ) -> Result<Order, ApiError> {
        (|| -> Result<Order, OrderError> {
            let claims = self.authenticate(authorization)?;
            let order_id = require_id(id)?;
            self.service
                .update_order_status(&claims, order_id, request.try_into()?)
        })()
        .map_err(ApiError::customer)
    }

    pub fn admin_update_order(
        &self,
        authorization: Option<&str>,
        id: Option<&str>,
        request: UpdateOrderRequest,
    ) -> Result<Order, ApiError> {
        (|| -> Result<Order, OrderError> {
            let claims = self.authenticate(authorization)?;
            let order_id = require_id(id)?;
            self.service
                .admin_update_status(&claims, order_id, request.try_into()?)
        })()
        .map_err(ApiError::admin)
    }

    pub fn cancel_approval(
        &self,
        authorization: Option<&str>,
        id: &str,
        request: CancelApprovalRequest,
    ) -> Result<CancellationOutcome, ApiError> {
        (|| -> Result<CancellationOutcome, OrderError> {
            let claims = self.authenticate(authorization)?;
            let order_id = require_id(Some(id))?;
            let decision = parse_decision(&request.action)?;
            self.service
                .process_cancellation(&claims, order_id, decision, request.admin_note)
        })()
        .map_err(ApiError::admin)
    }

    pub fn admin_archive_order(
        &self,
        authorization: Option<&str>,
        id: &str,
    ) -> Result<Order, ApiError> {
        (|| -> Result<Order, OrderError> {
            let claims = self.authenticate(authorization)?;
            let order_id = require_id(Some(id))?;
            self.service.archive_order(&claims, order_id)
        })()
        .map_err(ApiError::admin)
    }
}
