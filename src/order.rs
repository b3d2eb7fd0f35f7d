//! Core order records: status, payment, address, totals and line items
use super::error::OrderError;
use super::types::TimeStamp;
use chrono::Utc;
use std::str::FromStr;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Confirmed,
    #[n(2)]
    Processing,
    #[n(3)]
    Shipped,
    #[n(4)]
    Delivered,
    #[n(5)]
    Cancelled,
    #[n(6)]
    Returned,
    #[n(7)]
    PendingCancellation,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Processing,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
        OrderStatus::Returned,
        OrderStatus::PendingCancellation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Returned => "returned",
            OrderStatus::PendingCancellation => "pending_cancellation",
        }
    }

    /// The immediate next state on the happy path, if any.
    pub fn successor(&self) -> Option<OrderStatus> {
        match self {
            OrderStatus::Pending => Some(OrderStatus::Confirmed),
            OrderStatus::Confirmed => Some(OrderStatus::Processing),
            OrderStatus::Processing => Some(OrderStatus::Shipped),
            OrderStatus::Shipped => Some(OrderStatus::Delivered),
            _ => None,
        }
    }

    /// States from which a cancellation (direct or requested) may start.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Confirmed
                | OrderStatus::Processing
                | OrderStatus::Shipped
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Returned)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == needle)
            .ok_or_else(|| OrderError::Validation(format!("unknown order status '{s}'")))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSource {
    #[n(0)]
    Online,
    #[n(1)]
    Pos,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    #[n(0)]
    CashOnDelivery,
    #[n(1)]
    Gcash,
    #[n(2)]
    BankTransfer,
    #[n(3)]
    Cash,
}

impl PaymentMethod {
    /// Payments settled outside the shop that need a reference or screenshot as proof.
    pub fn requires_proof(&self) -> bool {
        matches!(self, PaymentMethod::Gcash | PaymentMethod::BankTransfer)
    }
}

impl FromStr for PaymentMethod {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cod" | "cash_on_delivery" => Ok(PaymentMethod::CashOnDelivery),
            "gcash" => Ok(PaymentMethod::Gcash),
            "bank_transfer" | "bank" => Ok(PaymentMethod::BankTransfer),
            "cash" => Ok(PaymentMethod::Cash),
            other => Err(OrderError::Validation(format!(
                "unsupported payment method '{other}'"
            ))),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Paid,
    #[n(2)]
    RefundPending,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Default)]
pub struct ShippingAddress {
    #[n(0)]
    pub full_name: String,
    #[n(1)]
    pub phone: String,
    #[n(2)]
    pub street: String,
    #[n(3)]
    pub city: String,
    #[n(4)]
    pub province: String,
    #[n(5)]
    pub region: String,
    #[n(6)]
    pub postal_code: String,
}

impl ShippingAddress {
    pub fn validate(&self) -> Result<(), OrderError> {
        let required = [
            ("full_name", &self.full_name),
            ("phone", &self.phone),
            ("street", &self.street),
            ("city", &self.city),
            ("province", &self.province),
            ("region", &self.region),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(OrderError::Validation(format!(
                    "shipping_address.{field} is required"
                )));
            }
        }
        Ok(())
    }
}

/// Monetary breakdown of an order, in centavos.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Totals {
    #[n(0)]
    pub subtotal: i64,
    #[n(1)]
    pub tax: i64,
    #[n(2)]
    pub shipping: i64,
    #[n(3)]
    pub discount: i64,
    #[n(4)]
    pub total: i64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Order {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub order_number: String,
    #[n(2)]
    pub user_id: String,
    #[n(3)]
    pub customer_email: Option<String>,
    #[n(4)]
    pub source: OrderSource,
    #[n(5)]
    pub status: OrderStatus,
    #[n(6)]
    pub payment_method: PaymentMethod,
    #[n(7)]
    pub payment_status: PaymentStatus,
    #[n(8)]
    pub payment_reference: Option<String>,
    #[n(9)]
    pub payment_screenshot: Option<String>,
    #[n(10)]
    pub totals: Totals,
    #[n(11)]
    pub shipping_address: Option<ShippingAddress>,
    #[n(12)]
    pub tracking_number: Option<String>,
    #[n(13)]
    pub cancellation_reason: Option<String>,
    #[n(14)]
    pub cancellation_requested_at: Option<TimeStamp<Utc>>,
    #[n(15)]
    pub status_before_cancellation: Option<OrderStatus>,
    #[n(16)]
    pub admin_note: Option<String>,
    #[n(17)]
    pub archived_at: Option<TimeStamp<Utc>>,
    #[n(18)]
    pub created_at: TimeStamp<Utc>,
    #[n(19)]
    pub updated_at: TimeStamp<Utc>,
    #[n(20)]
    pub delivered_at: Option<TimeStamp<Utc>>,
    // number of status events recorded and the digest of the newest one
    #[n(21)]
    pub history_len: u32,
    #[n(22)]
    pub history_head: Option<String>,
}

impl Order {
    /// A fresh `pending` order with no address, references or history yet.
    pub fn new(
        id: String,
        order_number: String,
        user_id: String,
        source: OrderSource,
        payment_method: PaymentMethod,
        totals: Totals,
    ) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            order_number,
            user_id,
            customer_email: None,
            source,
            status: OrderStatus::Pending,
            payment_method,
            payment_status: PaymentStatus::Pending,
            payment_reference: None,
            payment_screenshot: None,
            totals,
            shipping_address: None,
            tracking_number: None,
            cancellation_reason: None,
            cancellation_requested_at: None,
            status_before_cancellation: None,
            admin_note: None,
            archived_at: None,
            created_at: now.clone(),
            updated_at: now,
            delivered_at: None,
            history_len: 0,
            history_head: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// When the order reached a completed state, as used by retention.
    ///
    /// Delivered orders use `delivered_at` when recorded, otherwise `created_at`.
    /// Cancelled orders use `created_at`. Any other status is not complete.
    pub fn completed_at(&self) -> Option<&TimeStamp<Utc>> {
        match self.status {
            OrderStatus::Delivered => Some(self.delivered_at.as_ref().unwrap_or(&self.created_at)),
            OrderStatus::Cancelled => Some(&self.created_at),
            _ => None,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    #[n(0)]
    pub order_id: String,
    #[n(1)]
    pub product_id: String,
    #[n(2)]
    pub product_name: String,
    #[n(3)]
    pub quantity: u32,
    #[n(4)]
    pub size: String,
    #[n(5)]
    pub color: String,
    #[n(6)]
    pub unit_price: i64,
    #[n(7)]
    pub line_total: i64,
}
