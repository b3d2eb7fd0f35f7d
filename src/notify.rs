//! Customer notifications: outbound mail and in-app delivery notices
use super::order::{Order, OrderStatus};
use super::types::TimeStamp;
use super::utils::format_php;
use chrono::Utc;
use tracing::info;

/// Something worth telling a customer about. Rendering is left to the mailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderMail {
    Placed {
        order_number: String,
        to: String,
        total: i64,
    },
    StatusChanged {
        order_number: String,
        to: String,
        status: OrderStatus,
        tracking_number: Option<String>,
    },
    CancellationResolved {
        order_number: String,
        to: String,
        approved: bool,
        admin_note: Option<String>,
    },
}

impl OrderMail {
    pub fn placed(order: &Order) -> Option<Self> {
        order.customer_email.clone().map(|to| OrderMail::Placed {
            order_number: order.order_number.clone(),
            to,
            total: order.totals.total,
        })
    }
    pub fn status_changed(order: &Order) -> Option<Self> {
        order.customer_email.clone().map(|to| OrderMail::StatusChanged {
            order_number: order.order_number.clone(),
            to,
            status: order.status,
            tracking_number: order.tracking_number.clone(),
        })
    }
    pub fn cancellation_resolved(order: &Order, approved: bool) -> Option<Self> {
        order
            .customer_email
            .clone()
            .map(|to| OrderMail::CancellationResolved {
                order_number: order.order_number.clone(),
                to,
                approved,
                admin_note: order.admin_note.clone(),
            })
    }
    pub fn recipient(&self) -> &str {
        match self {
            OrderMail::Placed { to, .. }
            | OrderMail::StatusChanged { to, .. }
            | OrderMail::CancellationResolved { to, .. } => to,
        }
    }
}

/// Outbound mail transport.
pub trait Mailer: Send + Sync {
    fn send(&self, mail: &OrderMail) -> anyhow::Result<()>;
}

/// Writes mail to the log instead of sending it.
#[derive(Debug, Default)]
pub struct TracingMailer;

impl Mailer for TracingMailer {
    fn send(&self, mail: &OrderMail) -> anyhow::Result<()> {
        match mail {
            OrderMail::Placed {
                order_number,
                to,
                total,
            } => info!(%order_number, %to, total = %format_php(*total), "Order confirmation mail"),
            OrderMail::StatusChanged {
                order_number,
                to,
                status,
                ..
            } => info!(%order_number, %to, %status, "Status update mail"),
            OrderMail::CancellationResolved {
                order_number,
                to,
                approved,
                ..
            } => info!(%order_number, %to, approved, "Cancellation decision mail"),
        }
        Ok(())
    }
}

/// In-app notice raised when an order ships or is delivered.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct DeliveryNotification {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub order_id: String,
    #[n(2)]
    pub user_id: String,
    #[n(3)]
    pub status: OrderStatus,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct NotificationView {
    #[n(0)]
    pub notification_id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub viewed_at: TimeStamp<Utc>,
}

/// Statuses that raise a delivery notification.
pub fn raises_notification(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Shipped | OrderStatus::Delivered)
}
