//! Service layer API for order workflow operations
use super::auth::{AccessPolicy, Claims};
use super::error::OrderError;
use super::history::{StatusEvent, verify_chain};
use super::lifecycle::{Actor, Transition, next_status};
use super::notify::{
    DeliveryNotification, Mailer, NotificationView, OrderMail, TracingMailer, raises_notification,
};
use super::order::{
    Order, OrderItem, OrderSource, OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress,
};
use super::pricing::{PricedLine, PricingConfig};
use super::stock::{Product, StockLedger, StockLine, VariantMap};
use super::store::{Store, abort, child_key, decode, encode, history_key};
use super::types::TimeStamp;
use super::utils::{format_php, new_uuid_to_bech32};
use chrono::Utc;
use sled::Transactional;
use sled::transaction::ConflictableTransactionResult;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Where a rejected cancellation request sends the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectPolicy {
    /// Always back to `processing`, whatever the order was before the request.
    #[default]
    Processing,
    /// Back to the status recorded when the request was made.
    RestorePrevious,
}

#[derive(Debug, Clone, Default)]
pub struct OrderSettings {
    pub pricing: PricingConfig,
    pub access: AccessPolicy,
    pub reject_policy: RejectPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderItem {
    pub product_id: String,
    pub quantity: u32,
    pub size: String,
    pub color: String,
}

/// Online checkout request.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub items: Vec<NewOrderItem>,
    /// Total computed by the storefront; informational only.
    pub total: Option<i64>,
    pub customer_email: String,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub payment_screenshot: Option<String>,
    pub payment_reference: Option<String>,
}

/// In-store sale rung up by staff.
#[derive(Debug, Clone)]
pub struct CounterSale {
    pub items: Vec<NewOrderItem>,
    pub customer_email: Option<String>,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub discount: i64,
}

#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: Option<OrderStatus>,
    pub tracking_number: Option<String>,
    pub cancellation_reason: Option<String>,
    pub note: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
    pub fn with_tracking(mut self, tracking_number: impl Into<String>) -> Self {
        self.tracking_number = Some(tracking_number.into());
        self
    }
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.cancellation_reason = Some(reason.into());
        self
    }
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationOutcome {
    pub order: Order,
    pub decision: CancellationDecision,
    /// items whose stock was put back (always 0 on reject)
    pub restored_items: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderReceipt {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub include_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHistory {
    pub events: Vec<StatusEvent>,
    pub intact: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEntry {
    pub notification: DeliveryNotification,
    pub viewed: bool,
}

pub struct OrderService {
    store: Arc<Store>,
    ledger: StockLedger,
    settings: OrderSettings,
    mailer: Arc<dyn Mailer>,
}

fn fresh_id(hrp: &str) -> Result<String, OrderError> {
    new_uuid_to_bech32(hrp).map_err(|e| OrderError::Codec(e.to_string()))
}

fn require_text(field: &str, value: &str) -> Result<(), OrderError> {
    if value.trim().is_empty() {
        return Err(OrderError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn validate_items(items: &[NewOrderItem]) -> Result<(), OrderError> {
    if items.is_empty() {
        return Err(OrderError::Validation(
            "an order needs at least one item".into(),
        ));
    }
    for item in items {
        require_text("items.product_id", &item.product_id)?;
        require_text("items.size", &item.size)?;
        require_text("items.color", &item.color)?;
        if item.quantity == 0 {
            return Err(OrderError::Validation(format!(
                "quantity for {} must be positive",
                item.product_id
            )));
        }
    }
    Ok(())
}

impl NewOrder {
    pub fn validate(&self) -> Result<(), OrderError> {
        validate_items(&self.items)?;
        let email = self.customer_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(OrderError::Validation(
                "a valid customer_email is required".into(),
            ));
        }
        self.shipping_address.validate()?;
        if self.payment_method == PaymentMethod::Cash {
            return Err(OrderError::Validation(
                "cash payments are only accepted in store".into(),
            ));
        }
        let has_proof = [&self.payment_reference, &self.payment_screenshot]
            .into_iter()
            .flatten()
            .any(|proof| !proof.trim().is_empty());
        if self.payment_method.requires_proof() && !has_proof {
            return Err(OrderError::Validation(
                "payment_reference or payment_screenshot is required for this payment method"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Bookkeeping that follows the status an order has just entered.
fn apply_status_effects(order: &mut Order, from: OrderStatus, now: &TimeStamp<Utc>) {
    match order.status {
        OrderStatus::Confirmed
            if order.payment_method.requires_proof()
                && order.payment_status == PaymentStatus::Pending =>
        {
            order.payment_status = PaymentStatus::Paid;
        }
        OrderStatus::Delivered => {
            order.delivered_at = Some(now.clone());
            if order.payment_method == PaymentMethod::CashOnDelivery {
                order.payment_status = PaymentStatus::Paid;
            }
        }
        OrderStatus::Cancelled => {
            if order.payment_status == PaymentStatus::Paid {
                order.payment_status = PaymentStatus::RefundPending;
            }
            order.status_before_cancellation = None;
        }
        OrderStatus::PendingCancellation => {
            order.status_before_cancellation = Some(from);
            order.cancellation_requested_at = Some(now.clone());
        }
        _ => {}
    }
    // a rejected request leaves no trace on the order itself
    if from == OrderStatus::PendingCancellation && order.status != OrderStatus::Cancelled {
        order.cancellation_reason = None;
        order.cancellation_requested_at = None;
        order.status_before_cancellation = None;
    }
}

impl OrderService {
    pub fn new(store: Arc<Store>, settings: OrderSettings) -> Self {
        Self {
            ledger: StockLedger::new(store.clone()),
            store,
            settings,
            mailer: Arc::new(TracingMailer),
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    pub fn settings(&self) -> &OrderSettings {
        &self.settings
    }

    /// Place an online order: validate, price server-side, reserve stock, persist.
    #[instrument(skip(self, claims, request), fields(user_id = %claims.user_id, items = request.items.len()))]
    pub fn create_order(&self, claims: &Claims, request: NewOrder) -> Result<OrderReceipt, OrderError> {
        request.validate()?;

        let order_id = fresh_id("order_")?;
        let (lines, items, priced) = self.price_items(&order_id, &request.items)?;
        let totals = self
            .settings
            .pricing
            .quote(&priced, Some(&request.shipping_address.region))?;
        if let Some(client_total) = request.total {
            if client_total != totals.total {
                warn!(
                    client_total = %format_php(client_total),
                    server_total = %format_php(totals.total),
                    "Ignoring client submitted total"
                );
            }
        }

        let now = TimeStamp::new();
        let order_number = self.reserve_and_number(&lines, now.year())?;

        let mut order = Order::new(
            order_id,
            order_number,
            claims.user_id.clone(),
            OrderSource::Online,
            request.payment_method,
            totals,
        );
        order.customer_email = Some(request.customer_email.trim().to_string());
        order.shipping_address = Some(request.shipping_address);
        order.payment_reference = request.payment_reference;
        order.payment_screenshot = request.payment_screenshot;

        let receipt = self.persist_new(order, items, &lines, &claims.user_id)?;
        info!(
            order_id = %receipt.order.id,
            order_number = %receipt.order.order_number,
            total = %format_php(receipt.order.totals.total),
            "Order placed"
        );
        self.notify(OrderMail::placed(&receipt.order));
        Ok(receipt)
    }

    /// Ring up an in-store sale. The order is paid and handed over on the spot.
    #[instrument(skip(self, claims, sale), fields(user_id = %claims.user_id, items = sale.items.len()))]
    pub fn create_pos_order(&self, claims: &Claims, sale: CounterSale) -> Result<OrderReceipt, OrderError> {
        self.settings.access.require_privileged(claims)?;
        validate_items(&sale.items)?;

        let order_id = fresh_id("order_")?;
        let (lines, items, priced) = self.price_items(&order_id, &sale.items)?;
        let totals = self
            .settings
            .pricing
            .quote_counter_sale(&priced, sale.discount)?;

        let now = TimeStamp::new();
        let order_number = self.reserve_and_number(&lines, now.year())?;

        let mut order = Order::new(
            order_id,
            order_number,
            claims.user_id.clone(),
            OrderSource::Pos,
            sale.payment_method,
            totals,
        );
        order.status = OrderStatus::Delivered;
        order.delivered_at = Some(now);
        order.payment_status = PaymentStatus::Paid;
        order.payment_reference = sale.payment_reference;
        order.customer_email = sale
            .customer_email
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty());

        let receipt = self.persist_new(order, items, &lines, &claims.user_id)?;
        info!(
            order_id = %receipt.order.id,
            total = %format_php(receipt.order.totals.total),
            "Counter sale recorded"
        );
        Ok(receipt)
    }

    /// An order with its items, visible to its owner and to staff.
    pub fn get_order(&self, claims: &Claims, order_id: &str) -> Result<OrderReceipt, OrderError> {
        let order = self.visible_order(claims, order_id)?;
        let items = self.store.order_items(order_id)?;
        Ok(OrderReceipt { order, items })
    }

    /// Staff see every order, customers only their own. Newest first.
    pub fn list_orders(&self, claims: &Claims, filter: &OrderFilter) -> Result<Vec<Order>, OrderError> {
        let privileged = self.settings.access.is_privileged(claims);
        let mut orders: Vec<Order> = self
            .store
            .orders()?
            .into_iter()
            .filter(|order| privileged || order.user_id == claims.user_id)
            .filter(|order| filter.include_archived || !order.is_archived())
            .filter(|order| filter.status.is_none_or(|status| order.status == status))
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    /// Customer route: the caller must own the order.
    #[instrument(skip(self, claims, update), fields(user_id = %claims.user_id))]
    pub fn update_order_status(
        &self,
        claims: &Claims,
        order_id: &str,
        update: StatusUpdate,
    ) -> Result<Order, OrderError> {
        self.change_status(claims, Actor::Customer, Some(&claims.user_id), order_id, update)
    }

    /// Admin route: no ownership check, caller must be admin or staff.
    #[instrument(skip(self, claims, update), fields(user_id = %claims.user_id))]
    pub fn admin_update_status(
        &self,
        claims: &Claims,
        order_id: &str,
        update: StatusUpdate,
    ) -> Result<Order, OrderError> {
        let actor = self.settings.access.require_privileged(claims)?;
        self.change_status(claims, actor, None, order_id, update)
    }

    pub fn request_cancellation(
        &self,
        claims: &Claims,
        order_id: &str,
        reason: &str,
    ) -> Result<Order, OrderError> {
        self.update_order_status(
            claims,
            order_id,
            StatusUpdate::to(OrderStatus::PendingCancellation).with_reason(reason),
        )
    }

    pub fn mark_delivered(&self, claims: &Claims, order_id: &str) -> Result<Order, OrderError> {
        self.update_order_status(claims, order_id, StatusUpdate::to(OrderStatus::Delivered))
    }

    /// Confirm a delivered order came back. Staff may confirm any order, customers their own.
    pub fn confirm_return(&self, claims: &Claims, order_id: &str) -> Result<Order, OrderError> {
        let update = StatusUpdate::to(OrderStatus::Returned);
        if self.settings.access.is_privileged(claims) {
            self.change_status(claims, Actor::Staff, None, order_id, update)
        } else {
            self.change_status(claims, Actor::Customer, Some(&claims.user_id), order_id, update)
        }
    }

    /// Approve or reject a pending cancellation request.
    ///
    /// Approving cancels the order and puts every item's stock back; items
    /// that fail to restore are logged and skipped. Rejecting returns the
    /// order to the status chosen by [`RejectPolicy`] and clears the request.
    #[instrument(skip(self, claims, admin_note), fields(user_id = %claims.user_id))]
    pub fn process_cancellation(
        &self,
        claims: &Claims,
        order_id: &str,
        decision: CancellationDecision,
        admin_note: Option<String>,
    ) -> Result<CancellationOutcome, OrderError> {
        let actor = self.settings.access.require_privileged(claims)?;
        let current = self.store.order(order_id)?;
        if current.status != OrderStatus::PendingCancellation {
            return Err(OrderError::InvalidState(format!(
                "order {} is not pending cancellation (status: {})",
                current.order_number, current.status
            )));
        }

        let transition = match decision {
            CancellationDecision::Approve => Transition::ApproveCancellation,
            CancellationDecision::Reject => Transition::RejectCancellation {
                restore_to: self.reject_target(&current),
            },
        };
        let note = admin_note.as_deref().map(str::trim).filter(|n| !n.is_empty());
        let (_, order) = self.commit_transition(
            order_id,
            actor,
            &claims.user_id,
            None,
            &transition,
            note,
            |order| {
                if let Some(note) = note {
                    order.admin_note = Some(note.to_string());
                }
            },
        )?;

        let restored_items = match decision {
            CancellationDecision::Approve => self.restore_order_stock(&order),
            CancellationDecision::Reject => 0,
        };
        info!(
            order_id = %order.id,
            ?decision,
            restored_items,
            status = %order.status,
            "Cancellation request resolved"
        );
        self.notify(OrderMail::cancellation_resolved(
            &order,
            decision == CancellationDecision::Approve,
        ));

        Ok(CancellationOutcome {
            order,
            decision,
            restored_items,
        })
    }

    /// Soft-delete from the admin console: the order leaves the active list
    /// and its status is frozen until [`OrderService::unarchive_order`].
    pub fn archive_order(&self, claims: &Claims, order_id: &str) -> Result<Order, OrderError> {
        self.settings.access.require_privileged(claims)?;
        let now = TimeStamp::new();
        let order = self.store.update_order(order_id, |order| {
            if order.is_archived() {
                return Err(OrderError::InvalidState(format!(
                    "order {} is already archived",
                    order.order_number
                )));
            }
            order.archived_at = Some(now.clone());
            Ok(())
        })?;
        info!(order_id = %order.id, "Order archived by staff");
        Ok(order)
    }

    pub fn unarchive_order(&self, claims: &Claims, order_id: &str) -> Result<Order, OrderError> {
        self.settings.access.require_privileged(claims)?;
        let order = self.store.update_order(order_id, |order| {
            if !order.is_archived() {
                return Err(OrderError::InvalidState(format!(
                    "order {} is not archived",
                    order.order_number
                )));
            }
            order.archived_at = None;
            Ok(())
        })?;
        info!(order_id = %order.id, "Order restored from archive");
        Ok(order)
    }

    /// Status events for an order, and whether their digest chain is intact.
    pub fn order_history(&self, claims: &Claims, order_id: &str) -> Result<OrderHistory, OrderError> {
        let order = self.visible_order(claims, order_id)?;
        let events = self.store.history(order_id)?;
        let intact = verify_chain(&events, order.history_head.as_deref())?;
        if !intact {
            error!(order_id, "Order history digest chain is broken");
        }
        Ok(OrderHistory { events, intact })
    }

    pub fn verify_history(&self, claims: &Claims, order_id: &str) -> Result<bool, OrderError> {
        Ok(self.order_history(claims, order_id)?.intact)
    }

    pub fn list_notifications(&self, claims: &Claims) -> Result<Vec<NotificationEntry>, OrderError> {
        let mut entries = vec![];
        for notification in self.store.notifications()? {
            if notification.user_id != claims.user_id {
                continue;
            }
            let viewed = self
                .store
                .views_for(&notification.id)?
                .iter()
                .any(|view| view.user_id == claims.user_id);
            entries.push(NotificationEntry {
                notification,
                viewed,
            });
        }
        entries.sort_by(|a, b| b.notification.created_at.cmp(&a.notification.created_at));
        Ok(entries)
    }

    pub fn mark_notification_viewed(
        &self,
        claims: &Claims,
        order_id: &str,
        notification_id: &str,
    ) -> Result<(), OrderError> {
        let notification = self
            .store
            .notification(order_id, notification_id)?
            .filter(|n| {
                n.user_id == claims.user_id || self.settings.access.is_privileged(claims)
            })
            .ok_or_else(|| OrderError::NotFound {
                kind: "Notification",
                id: notification_id.to_string(),
            })?;
        self.store.put_view(&NotificationView {
            notification_id: notification.id,
            user_id: claims.user_id.clone(),
            viewed_at: TimeStamp::new(),
        })
    }

    pub fn create_product(
        &self,
        claims: &Claims,
        name: &str,
        price: i64,
        variants: VariantMap,
    ) -> Result<Product, OrderError> {
        self.settings.access.require_privileged(claims)?;
        self.ledger
            .create_product(name.trim().to_string(), price, variants)
    }

    pub fn set_variant_quantity(
        &self,
        claims: &Claims,
        product_id: &str,
        color: &str,
        size: &str,
        quantity: u32,
    ) -> Result<Product, OrderError> {
        self.settings.access.require_privileged(claims)?;
        let product = self
            .ledger
            .set_variant_quantity(product_id, color, size, quantity)?;
        info!(product_id, color, size, quantity, "Variant stock set");
        Ok(product)
    }

    pub fn get_product(&self, product_id: &str) -> Result<Product, OrderError> {
        self.ledger.get_product(product_id)
    }

    fn visible_order(&self, claims: &Claims, order_id: &str) -> Result<Order, OrderError> {
        let order = self.store.order(order_id)?;
        if order.user_id != claims.user_id && !self.settings.access.is_privileged(claims) {
            return Err(OrderError::order_not_found(order_id));
        }
        Ok(order)
    }

    fn reject_target(&self, order: &Order) -> OrderStatus {
        match self.settings.reject_policy {
            RejectPolicy::Processing => OrderStatus::Processing,
            RejectPolicy::RestorePrevious => order
                .status_before_cancellation
                .filter(OrderStatus::is_cancellable)
                .unwrap_or(OrderStatus::Processing),
        }
    }

    /// Look up products, check each variant has enough stock, and price the lines.
    fn price_items(
        &self,
        order_id: &str,
        requested: &[NewOrderItem],
    ) -> Result<(Vec<StockLine>, Vec<OrderItem>, Vec<PricedLine>), OrderError> {
        let mut lines = Vec::with_capacity(requested.len());
        let mut items = Vec::with_capacity(requested.len());
        let mut priced = Vec::with_capacity(requested.len());
        for item in requested {
            let product = self.store.product(&item.product_id)?;
            let available = product.available(&item.color, &item.size);
            if item.quantity > available {
                return Err(OrderError::InsufficientStock {
                    product_id: product.id,
                    color: item.color.clone(),
                    size: item.size.clone(),
                    requested: item.quantity,
                    available,
                });
            }
            let line = PricedLine {
                unit_price: product.price,
                quantity: item.quantity,
            };
            items.push(OrderItem {
                order_id: order_id.to_string(),
                product_id: product.id.clone(),
                product_name: product.name.clone(),
                quantity: item.quantity,
                size: item.size.clone(),
                color: item.color.clone(),
                unit_price: product.price,
                line_total: line.line_total()?,
            });
            lines.push(StockLine {
                product_id: product.id,
                color: item.color.clone(),
                size: item.size.clone(),
                quantity: item.quantity,
            });
            priced.push(line);
        }
        Ok((lines, items, priced))
    }

    /// Reserve stock first and only then allocate the order number, so a
    /// shortage never consumes a number. The sequence only skips a number when
    /// the final insert of an already numbered order fails.
    fn reserve_and_number(&self, lines: &[StockLine], year: i32) -> Result<String, OrderError> {
        self.ledger.reserve_lines(lines)?;
        self.store.next_order_number(year).inspect_err(|e| {
            error!(error = %e, "Failed to allocate order number, releasing stock");
            self.release_stock(lines);
        })
    }

    /// Persist a new order; on failure hand the reserved stock back.
    fn persist_new(
        &self,
        mut order: Order,
        items: Vec<OrderItem>,
        lines: &[StockLine],
        actor_id: &str,
    ) -> Result<OrderReceipt, OrderError> {
        if let Err(e) = self.store.insert_order(&mut order, &items, actor_id) {
            error!(order_id = %order.id, error = %e, "Failed to persist order, releasing stock");
            self.release_stock(lines);
            return Err(e);
        }
        Ok(OrderReceipt { order, items })
    }

    fn release_stock(&self, lines: &[StockLine]) {
        let report = self.ledger.restore_lines(lines);
        if !report.failed.is_empty() {
            error!(failed = report.failed.len(), "Stock rollback incomplete");
        }
    }

    fn change_status(
        &self,
        claims: &Claims,
        actor: Actor,
        owner: Option<&str>,
        order_id: &str,
        update: StatusUpdate,
    ) -> Result<Order, OrderError> {
        let target = update
            .status
            .ok_or_else(|| OrderError::Validation("status is required".into()))?;
        let transition = Transition::for_target(target);
        let reason = update
            .cancellation_reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        if transition == Transition::RequestCancellation && reason.is_none() {
            return Err(OrderError::Validation(
                "cancellation_reason is required".into(),
            ));
        }
        let tracking = update
            .tracking_number
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let note = update.note.as_deref().map(str::trim).filter(|n| !n.is_empty());

        let (from, order) = self.commit_transition(
            order_id,
            actor,
            &claims.user_id,
            owner,
            &transition,
            note,
            |order| {
                if let Some(tracking) = tracking {
                    order.tracking_number = Some(tracking.to_string());
                }
                if order.status == OrderStatus::PendingCancellation {
                    order.cancellation_reason = reason.map(String::from);
                }
                if let (Actor::Staff, Some(note)) = (actor, note) {
                    order.admin_note = Some(note.to_string());
                }
            },
        )?;
        info!(order_id = %order.id, %from, to = %order.status, ?actor, "Order status changed");

        if order.status == OrderStatus::Cancelled {
            let restored = self.restore_order_stock(&order);
            info!(order_id = %order.id, restored, "Stock restored for cancelled order");
        }
        self.notify(OrderMail::status_changed(&order));
        Ok(order)
    }

    /// Apply `transition` to the stored order in one transaction that also
    /// appends the history event and any delivery notification. Nothing is
    /// written when the transition is not allowed.
    #[allow(clippy::too_many_arguments)]
    fn commit_transition(
        &self,
        order_id: &str,
        actor: Actor,
        actor_id: &str,
        owner: Option<&str>,
        transition: &Transition,
        note: Option<&str>,
        edit: impl Fn(&mut Order),
    ) -> Result<(OrderStatus, Order), OrderError> {
        let notification_id = fresh_id("notif_")?;
        let now = TimeStamp::new();

        (&self.store.orders, &self.store.history, &self.store.notifications)
            .transaction(
                |(tx_orders, tx_history, tx_notifications)| -> ConflictableTransactionResult<(OrderStatus, Order), OrderError> {
                    let bytes = tx_orders
                        .get(order_id.as_bytes())?
                        .ok_or_else(|| abort(OrderError::order_not_found(order_id)))?;
                    let mut order: Order = decode(&bytes).map_err(abort)?;
                    if owner.is_some_and(|owner| owner != order.user_id) {
                        return Err(abort(OrderError::order_not_found(order_id)));
                    }
                    if order.is_archived() {
                        return Err(abort(OrderError::InvalidState(format!(
                            "order {} is archived; unarchive it before changing its status",
                            order.order_number
                        ))));
                    }

                    let from = order.status;
                    order.status =
                        next_status(from, transition, actor).map_err(|e| abort(e.into()))?;
                    order.updated_at = now.clone();
                    apply_status_effects(&mut order, from, &now);
                    edit(&mut order);

                    let event = StatusEvent::new(
                        order.id.clone(),
                        actor_id.to_string(),
                        Some(from),
                        order.status,
                        note.map(String::from),
                    )
                    .chained(order.history_len, order.history_head.clone());
                    let (digest, event_cbor) = event.build().map_err(abort)?;
                    tx_history.insert(
                        history_key(order_id, order.history_len).as_bytes(),
                        event_cbor,
                    )?;
                    order.history_len += 1;
                    order.history_head = Some(digest);

                    if raises_notification(order.status) {
                        let notification = DeliveryNotification {
                            id: notification_id.clone(),
                            order_id: order.id.clone(),
                            user_id: order.user_id.clone(),
                            status: order.status,
                            created_at: now.clone(),
                        };
                        tx_notifications.insert(
                            child_key(order_id, &notification_id).as_bytes(),
                            encode(&notification).map_err(abort)?,
                        )?;
                    }

                    tx_orders.insert(order_id.as_bytes(), encode(&order).map_err(abort)?)?;
                    Ok((from, order))
                },
            )
            .map_err(OrderError::from)
    }

    /// Put every item of a cancelled order back on the shelf. Returns how
    /// many items were restored; failures are logged and skipped.
    fn restore_order_stock(&self, order: &Order) -> usize {
        let items = match self.store.order_items(&order.id) {
            Ok(items) => items,
            Err(e) => {
                error!(order_id = %order.id, error = %e, "Could not load items to restore stock");
                return 0;
            }
        };
        let lines: Vec<StockLine> = items
            .into_iter()
            .map(|item| StockLine {
                product_id: item.product_id,
                color: item.color,
                size: item.size,
                quantity: item.quantity,
            })
            .collect();
        let report = self.ledger.restore_lines(&lines);
        if !report.failed.is_empty() {
            warn!(
                order_id = %order.id,
                failed = report.failed.len(),
                "Some items could not be restocked"
            );
        }
        report.restored
    }

    fn notify(&self, mail: Option<OrderMail>) {
        if let Some(mail) = mail {
            if let Err(e) = self.mailer.send(&mail) {
                warn!(recipient = mail.recipient(), error = %e, "Failed to send order mail");
            }
        }
    }
}
