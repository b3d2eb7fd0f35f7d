use anyhow::Context;
use gkicks_orders::auth::{AccessPolicy, Claims, Role};
use gkicks_orders::error::OrderError;
use gkicks_orders::notify::{Mailer, OrderMail};
use gkicks_orders::order::{OrderSource, OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress};
use gkicks_orders::service::{
    CancellationDecision, CounterSale, NewOrder, NewOrderItem, OrderFilter, OrderService,
    OrderSettings, RejectPolicy, StatusUpdate,
};
use gkicks_orders::stock::{Product, VariantMap};
use gkicks_orders::store::Store;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir}; // Use for test db cleanup.

/// Keeps every mail so tests can assert on what customers were told.
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OrderMail>>,
}

impl Mailer for RecordingMailer {
    fn send(&self, mail: &OrderMail) -> anyhow::Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("mailer poisoned"))?
            .push(mail.clone());
        Ok(())
    }
}

struct Shop {
    // held so the database directory outlives the test
    _dir: TempDir,
    service: OrderService,
    mailer: Arc<RecordingMailer>,
    admin: Claims,
    customer: Claims,
}

fn open_shop(name: &str, settings: OrderSettings) -> anyhow::Result<Shop> {
    // sled locks its directory, so every test gets its own database
    let dir = tempdir()?;
    let store = Arc::new(Store::open(dir.path().join(name))?);
    let mailer = Arc::new(RecordingMailer::default());
    let service = OrderService::new(store, settings).with_mailer(mailer.clone());

    Ok(Shop {
        _dir: dir,
        service,
        mailer,
        admin: Claims::new("user_admin", "owner@gkicks.ph", Role::Admin),
        customer: Claims::new("user_juan", "juan@mail.com", Role::Customer),
    })
}

fn shop(name: &str) -> anyhow::Result<Shop> {
    open_shop(name, OrderSettings::default())
}

fn variants(entries: &[(&str, &str, u32)]) -> VariantMap {
    let mut map: VariantMap = BTreeMap::new();
    for (color, size, quantity) in entries {
        map.entry(color.to_string())
            .or_default()
            .insert(size.to_string(), *quantity);
    }
    map
}

fn address(region: &str) -> ShippingAddress {
    ShippingAddress {
        full_name: "Juan Dela Cruz".into(),
        phone: "09171234567".into(),
        street: "12 Mabini St".into(),
        city: "Quezon City".into(),
        province: "Metro Manila".into(),
        region: region.into(),
        postal_code: "1100".into(),
    }
}

fn item(product: &Product, color: &str, size: &str, quantity: u32) -> NewOrderItem {
    NewOrderItem {
        product_id: product.id.clone(),
        quantity,
        size: size.into(),
        color: color.into(),
    }
}

fn checkout(items: Vec<NewOrderItem>, payment_method: PaymentMethod) -> NewOrder {
    NewOrder {
        items,
        total: None,
        customer_email: "juan@mail.com".into(),
        shipping_address: address("NCR"),
        payment_method,
        payment_screenshot: None,
        payment_reference: None,
    }
}

fn red_runner(shop: &Shop, stock: u32) -> anyhow::Result<Product> {
    Ok(shop.service.create_product(
        &shop.admin,
        "Air Runner",
        350_000,
        variants(&[("Red", "42", stock), ("Black", "41", 2)]),
    )?)
}

#[test]
fn cancellation_approval_puts_stock_back() -> anyhow::Result<()> {
    let shop = shop("approve_cancellation.db")?;
    let product = red_runner(&shop, 5)?;

    let receipt = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 2)], PaymentMethod::CashOnDelivery),
        )
        .context("Order failed on create: ")?;
    let order_id = receipt.order.id.clone();

    let after_order = shop.service.get_product(&product.id)?;
    assert_eq!(after_order.available("Red", "42"), 3);
    assert_eq!(after_order.stock_quantity(), 5);

    let requested = shop
        .service
        .request_cancellation(&shop.customer, &order_id, "Ordered the wrong size")?;
    assert_eq!(requested.status, OrderStatus::PendingCancellation);
    assert_eq!(
        requested.cancellation_reason.as_deref(),
        Some("Ordered the wrong size")
    );
    assert_eq!(requested.status_before_cancellation, Some(OrderStatus::Pending));

    let outcome = shop
        .service
        .process_cancellation(
            &shop.admin,
            &order_id,
            CancellationDecision::Approve,
            Some("Approved, refund not needed".into()),
        )
        .context("Cancellation failed on approval: ")?;

    assert_eq!(outcome.order.status, OrderStatus::Cancelled);
    assert_eq!(outcome.restored_items, 1);
    assert_eq!(
        outcome.order.admin_note.as_deref(),
        Some("Approved, refund not needed")
    );

    let restored = shop.service.get_product(&product.id)?;
    assert_eq!(restored.available("Red", "42"), 5);
    assert_eq!(restored.stock_quantity(), restored.variant_total());

    let sent = shop.mailer.sent.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
    assert!(matches!(sent.first(), Some(OrderMail::Placed { .. })));
    assert!(matches!(
        sent.last(),
        Some(OrderMail::CancellationResolved { approved: true, .. })
    ));

    Ok(())
}

#[test]
fn approving_twice_fails_cleanly() -> anyhow::Result<()> {
    let shop = shop("approve_twice.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 2)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    shop.service
        .request_cancellation(&shop.customer, &order_id, "Too slow")?;
    shop.service.process_cancellation(
        &shop.admin,
        &order_id,
        CancellationDecision::Approve,
        None,
    )?;

    let again = shop.service.process_cancellation(
        &shop.admin,
        &order_id,
        CancellationDecision::Approve,
        None,
    );
    assert!(matches!(again, Err(OrderError::InvalidState(_))));
    // stock restored exactly once
    assert_eq!(shop.service.get_product(&product.id)?.available("Red", "42"), 5);

    Ok(())
}

#[test]
fn rejection_returns_order_to_processing() -> anyhow::Result<()> {
    let shop = shop("reject_cancellation.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Confirmed),
    )?;
    shop.service
        .request_cancellation(&shop.customer, &order_id, "Found it cheaper")?;

    let outcome = shop.service.process_cancellation(
        &shop.admin,
        &order_id,
        CancellationDecision::Reject,
        Some("Already packed".into()),
    )?;

    assert_eq!(outcome.order.status, OrderStatus::Processing);
    assert_eq!(outcome.restored_items, 0);
    assert_eq!(outcome.order.cancellation_reason, None);
    assert_eq!(outcome.order.cancellation_requested_at, None);
    assert_eq!(outcome.order.admin_note.as_deref(), Some("Already packed"));
    assert_eq!(shop.service.get_product(&product.id)?.available("Red", "42"), 4);

    Ok(())
}

#[test]
fn rejection_can_restore_the_previous_status() -> anyhow::Result<()> {
    let settings = OrderSettings {
        reject_policy: RejectPolicy::RestorePrevious,
        ..OrderSettings::default()
    };
    let shop = open_shop("reject_restore_previous.db", settings)?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Confirmed),
    )?;
    shop.service
        .request_cancellation(&shop.customer, &order_id, "Changed my mind")?;

    let outcome = shop.service.process_cancellation(
        &shop.admin,
        &order_id,
        CancellationDecision::Reject,
        None,
    )?;
    assert_eq!(outcome.order.status, OrderStatus::Confirmed);
    assert_eq!(outcome.order.status_before_cancellation, None);

    Ok(())
}

#[test]
fn deciding_on_an_order_without_a_request_changes_nothing() -> anyhow::Result<()> {
    let shop = shop("no_pending_request.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    let before = shop.service.get_order(&shop.admin, &order_id)?;

    for decision in [CancellationDecision::Approve, CancellationDecision::Reject] {
        let result = shop
            .service
            .process_cancellation(&shop.admin, &order_id, decision, None);
        match result {
            Err(OrderError::InvalidState(message)) => {
                assert!(message.contains("not pending cancellation"))
            }
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }
    assert_eq!(shop.service.get_order(&shop.admin, &order_id)?, before);

    Ok(())
}

#[test]
fn only_staff_resolve_cancellations() -> anyhow::Result<()> {
    let shop = shop("customer_cannot_approve.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    shop.service
        .request_cancellation(&shop.customer, &order_id, "Oops")?;

    let result = shop.service.process_cancellation(
        &shop.customer,
        &order_id,
        CancellationDecision::Approve,
        None,
    );
    assert!(matches!(result, Err(OrderError::Forbidden(_))));

    // designated staff emails count as privileged
    let settings = OrderSettings {
        access: AccessPolicy::new(["desk@gkicks.ph"]),
        ..OrderSettings::default()
    };
    let staffed = open_shop("staff_can_approve.db", settings)?;
    let product = red_runner(&staffed, 5)?;
    let order_id = staffed
        .service
        .create_order(
            &staffed.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    staffed
        .service
        .request_cancellation(&staffed.customer, &order_id, "Oops")?;
    let desk = Claims::new("user_desk", "Desk@GKicks.ph", Role::Customer);
    let outcome = staffed.service.process_cancellation(
        &desk,
        &order_id,
        CancellationDecision::Approve,
        None,
    )?;
    assert_eq!(outcome.order.status, OrderStatus::Cancelled);

    Ok(())
}

#[test]
fn totals_are_computed_server_side() -> anyhow::Result<()> {
    let shop = shop("server_totals.db")?;
    let product = red_runner(&shop, 5)?;

    let mut request = checkout(vec![item(&product, "Red", "42", 2)], PaymentMethod::CashOnDelivery);
    request.shipping_address = address("Visayas");
    // whatever the storefront claims is ignored
    request.total = Some(1);

    let order = shop.service.create_order(&shop.customer, request)?.order;
    assert_eq!(order.totals.subtotal, 700_000);
    assert_eq!(order.totals.tax, 84_000);
    assert_eq!(order.totals.shipping, 10_000 + 5_000);
    assert_eq!(
        order.totals.total,
        order.totals.subtotal + order.totals.tax + order.totals.shipping - order.totals.discount
    );
    assert_eq!(order.source, OrderSource::Online);
    assert!(order.order_number.starts_with("GK-"));
    assert!(order.order_number.ends_with("-000001"));

    Ok(())
}

#[test]
fn shortage_on_any_line_reserves_nothing() -> anyhow::Result<()> {
    let shop = shop("shortage.db")?;
    let product = red_runner(&shop, 5)?;

    let result = shop.service.create_order(
        &shop.customer,
        checkout(
            vec![
                item(&product, "Red", "42", 2),
                item(&product, "Black", "41", 3),
            ],
            PaymentMethod::CashOnDelivery,
        ),
    );
    assert!(matches!(
        result,
        Err(OrderError::InsufficientStock {
            requested: 3,
            available: 2,
            ..
        })
    ));

    let untouched = shop.service.get_product(&product.id)?;
    assert_eq!(untouched.available("Red", "42"), 5);
    assert_eq!(untouched.available("Black", "41"), 2);
    assert!(
        shop.service
            .list_orders(&shop.admin, &OrderFilter::default())?
            .is_empty()
    );

    Ok(())
}

#[test]
fn unknown_variants_have_no_stock() -> anyhow::Result<()> {
    let shop = shop("unknown_variant.db")?;
    let product = red_runner(&shop, 5)?;

    let result = shop.service.create_order(
        &shop.customer,
        checkout(vec![item(&product, "Green", "40", 1)], PaymentMethod::CashOnDelivery),
    );
    assert!(matches!(
        result,
        Err(OrderError::InsufficientStock { available: 0, .. })
    ));

    Ok(())
}

#[test]
fn checkout_validation() -> anyhow::Result<()> {
    let shop = shop("checkout_validation.db")?;
    let product = red_runner(&shop, 5)?;

    let no_proof = checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::Gcash);
    assert!(matches!(
        shop.service.create_order(&shop.customer, no_proof),
        Err(OrderError::Validation(_))
    ));

    let mut with_proof = checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::Gcash);
    with_proof.payment_reference = Some("GC-0042".into());
    let order = shop.service.create_order(&shop.customer, with_proof)?.order;
    assert_eq!(order.payment_status, PaymentStatus::Pending);

    let empty = checkout(vec![], PaymentMethod::CashOnDelivery);
    assert!(matches!(
        shop.service.create_order(&shop.customer, empty),
        Err(OrderError::Validation(_))
    ));

    let mut bad_email = checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery);
    bad_email.customer_email = "juan".into();
    assert!(matches!(
        shop.service.create_order(&shop.customer, bad_email),
        Err(OrderError::Validation(_))
    ));

    Ok(())
}

#[test]
fn full_lifecycle_to_delivery_and_return() -> anyhow::Result<()> {
    let shop = shop("full_lifecycle.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;

    for status in [OrderStatus::Confirmed, OrderStatus::Processing] {
        shop.service
            .admin_update_status(&shop.admin, &order_id, StatusUpdate::to(status))?;
    }
    let shipped = shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Shipped).with_tracking("LBC-123456"),
    )?;
    assert_eq!(shipped.tracking_number.as_deref(), Some("LBC-123456"));

    // the admin console may not confirm delivery
    let result = shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Delivered),
    );
    assert!(matches!(result, Err(OrderError::InvalidState(_))));

    let delivered = shop.service.mark_delivered(&shop.customer, &order_id)?;
    assert_eq!(delivered.status, OrderStatus::Delivered);
    assert_eq!(delivered.payment_status, PaymentStatus::Paid);
    assert!(delivered.delivered_at.is_some());

    let returned = shop.service.confirm_return(&shop.customer, &order_id)?;
    assert_eq!(returned.status, OrderStatus::Returned);

    let history = shop.service.order_history(&shop.customer, &order_id)?;
    let path: Vec<OrderStatus> = history.events.iter().map(|event| event.to).collect();
    assert_eq!(
        path,
        vec![
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Returned,
        ]
    );
    assert!(history.intact);
    assert!(shop.service.verify_history(&shop.admin, &order_id)?);

    Ok(())
}

#[test]
fn invalid_transitions_leave_the_order_alone() -> anyhow::Result<()> {
    let shop = shop("invalid_transitions.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    let before = shop.service.get_order(&shop.admin, &order_id)?;

    let skip = shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Shipped),
    );
    assert!(matches!(skip, Err(OrderError::InvalidState(_))));

    let early_delivery = shop.service.mark_delivered(&shop.customer, &order_id);
    assert!(matches!(early_delivery, Err(OrderError::InvalidState(_))));

    let no_reason = shop.service.update_order_status(
        &shop.customer,
        &order_id,
        StatusUpdate::to(OrderStatus::PendingCancellation),
    );
    assert!(matches!(no_reason, Err(OrderError::Validation(_))));

    let customer_on_admin_route = shop.service.admin_update_status(
        &shop.customer,
        &order_id,
        StatusUpdate::to(OrderStatus::Confirmed),
    );
    assert!(matches!(
        customer_on_admin_route,
        Err(OrderError::Forbidden(_))
    ));

    let stranger = Claims::new("user_other", "other@mail.com", Role::Customer);
    let not_theirs = shop
        .service
        .request_cancellation(&stranger, &order_id, "Not mine");
    assert!(matches!(not_theirs, Err(OrderError::NotFound { .. })));

    assert_eq!(shop.service.get_order(&shop.admin, &order_id)?, before);
    assert_eq!(shop.service.order_history(&shop.admin, &order_id)?.events.len(), 1);

    Ok(())
}

#[test]
fn direct_cancellation_restocks_and_flags_refunds() -> anyhow::Result<()> {
    let shop = shop("direct_cancel.db")?;
    let product = red_runner(&shop, 5)?;
    let mut request = checkout(vec![item(&product, "Red", "42", 2)], PaymentMethod::BankTransfer);
    request.payment_screenshot = Some("uploads/receipt-42.png".into());
    let order_id = shop.service.create_order(&shop.customer, request)?.order.id;

    let confirmed = shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Confirmed),
    )?;
    assert_eq!(confirmed.payment_status, PaymentStatus::Paid);

    let cancelled = shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Cancelled).with_note("Out of courier range"),
    )?;
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.payment_status, PaymentStatus::RefundPending);
    assert_eq!(cancelled.admin_note.as_deref(), Some("Out of courier range"));
    assert_eq!(shop.service.get_product(&product.id)?.available("Red", "42"), 5);

    // terminal
    let reopen = shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Processing),
    );
    assert!(matches!(reopen, Err(OrderError::InvalidState(_))));

    Ok(())
}

#[test]
fn counter_sales_are_paid_and_delivered() -> anyhow::Result<()> {
    let shop = shop("counter_sale.db")?;
    let product = red_runner(&shop, 5)?;

    let sale = CounterSale {
        items: vec![item(&product, "Red", "42", 1)],
        customer_email: None,
        payment_method: PaymentMethod::Cash,
        payment_reference: None,
        discount: 20_000,
    };
    let order = shop.service.create_pos_order(&shop.admin, sale.clone())?.order;

    assert_eq!(order.source, OrderSource::Pos);
    assert_eq!(order.status, OrderStatus::Delivered);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.totals.shipping, 0);
    assert_eq!(order.totals.total, 350_000 + 42_000 - 20_000);
    assert!(order.shipping_address.is_none());
    assert_eq!(shop.service.get_product(&product.id)?.available("Red", "42"), 4);

    assert!(matches!(
        shop.service.create_pos_order(&shop.customer, sale),
        Err(OrderError::Forbidden(_))
    ));

    Ok(())
}

#[test]
fn customers_only_see_their_own_orders() -> anyhow::Result<()> {
    let shop = shop("order_visibility.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    let stranger = Claims::new("user_other", "other@mail.com", Role::Customer);

    assert_eq!(
        shop.service
            .list_orders(&shop.customer, &OrderFilter::default())?
            .len(),
        1
    );
    assert!(
        shop.service
            .list_orders(&stranger, &OrderFilter::default())?
            .is_empty()
    );
    assert!(matches!(
        shop.service.get_order(&stranger, &order_id),
        Err(OrderError::NotFound { .. })
    ));

    let receipt = shop.service.get_order(&shop.customer, &order_id)?;
    assert_eq!(receipt.items.len(), 1);
    assert_eq!(receipt.items[0].line_total, 350_000);

    Ok(())
}

#[test]
fn archived_orders_leave_the_active_list() -> anyhow::Result<()> {
    let shop = shop("soft_archive.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;

    let archived = shop.service.archive_order(&shop.admin, &order_id)?;
    assert!(archived.is_archived());
    assert!(matches!(
        shop.service.archive_order(&shop.admin, &order_id),
        Err(OrderError::InvalidState(_))
    ));

    assert!(
        shop.service
            .list_orders(&shop.admin, &OrderFilter::default())?
            .is_empty()
    );
    let everything = OrderFilter {
        include_archived: true,
        ..OrderFilter::default()
    };
    assert_eq!(shop.service.list_orders(&shop.admin, &everything)?.len(), 1);

    let restored = shop.service.unarchive_order(&shop.admin, &order_id)?;
    assert!(!restored.is_archived());
    assert!(matches!(
        shop.service.archive_order(&shop.customer, &order_id),
        Err(OrderError::Forbidden(_))
    ));

    Ok(())
}

#[test]
fn shipping_and_delivery_raise_notifications() -> anyhow::Result<()> {
    let shop = shop("notifications.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    for status in [
        OrderStatus::Confirmed,
        OrderStatus::Processing,
        OrderStatus::Shipped,
    ] {
        shop.service
            .admin_update_status(&shop.admin, &order_id, StatusUpdate::to(status))?;
    }

    let entries = shop.service.list_notifications(&shop.customer)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].notification.status, OrderStatus::Shipped);
    assert!(!entries[0].viewed);

    shop.service.mark_notification_viewed(
        &shop.customer,
        &order_id,
        &entries[0].notification.id,
    )?;
    shop.service.mark_delivered(&shop.customer, &order_id)?;

    let entries = shop.service.list_notifications(&shop.customer)?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries.iter().filter(|entry| entry.viewed).count(), 1);

    let stranger = Claims::new("user_other", "other@mail.com", Role::Customer);
    assert!(matches!(
        shop.service
            .mark_notification_viewed(&stranger, &order_id, &entries[0].notification.id),
        Err(OrderError::NotFound { .. })
    ));

    Ok(())
}

#[test]
fn stock_counts_are_admin_only() -> anyhow::Result<()> {
    let shop = shop("stock_admin.db")?;
    let product = red_runner(&shop, 5)?;

    let recount = shop
        .service
        .set_variant_quantity(&shop.admin, &product.id, "Red", "43", 7)?;
    assert_eq!(recount.available("Red", "43"), 7);
    assert_eq!(recount.stock_quantity(), 5 + 2 + 7);

    assert!(matches!(
        shop.service
            .set_variant_quantity(&shop.customer, &product.id, "Red", "43", 0),
        Err(OrderError::Forbidden(_))
    ));
    assert!(matches!(
        shop.service.get_product("product_missing"),
        Err(OrderError::NotFound { .. })
    ));

    Ok(())
}

#[test]
fn oversized_prices_are_rejected_before_stock_moves() -> anyhow::Result<()> {
    let shop = shop("oversized_price.db")?;
    let product = shop.service.create_product(
        &shop.admin,
        "Gold Runner",
        i64::MAX / 2,
        variants(&[("Gold", "42", 5)]),
    )?;

    let result = shop.service.create_order(
        &shop.customer,
        checkout(vec![item(&product, "Gold", "42", 3)], PaymentMethod::CashOnDelivery),
    );
    assert!(matches!(result, Err(OrderError::Validation(_))));

    assert_eq!(shop.service.get_product(&product.id)?.available("Gold", "42"), 5);
    assert!(
        shop.service
            .list_orders(&shop.admin, &OrderFilter::default())?
            .is_empty()
    );

    Ok(())
}

#[test]
fn concurrent_checkouts_never_oversell() -> anyhow::Result<()> {
    const THREADS: usize = 8;
    const ATTEMPTS: usize = 20;
    const STOCK: u32 = 50;

    let shop = shop("concurrent_checkout.db")?;
    let product = red_runner(&shop, STOCK)?;

    let (shop, product) = (&shop, &product);
    let placed: Vec<String> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(move || {
                    let mut numbers = Vec::new();
                    for _ in 0..ATTEMPTS {
                        match shop.service.create_order(
                            &shop.customer,
                            checkout(
                                vec![item(product, "Red", "42", 1)],
                                PaymentMethod::CashOnDelivery,
                            ),
                        ) {
                            Ok(receipt) => numbers.push(receipt.order.order_number),
                            Err(OrderError::InsufficientStock { .. }) => {}
                            Err(other) => panic!("unexpected checkout error: {other:?}"),
                        }
                    }
                    numbers
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().expect("checkout thread panicked"))
            .collect()
    });

    let after = shop.service.get_product(&product.id)?;
    let remaining = after.available("Red", "42");
    assert_eq!(placed.len() + remaining as usize, STOCK as usize);
    assert_eq!(remaining, 0);
    assert_eq!(after.available("Black", "41"), 2);
    assert_eq!(after.stock_quantity(), after.variant_total());

    let unique: BTreeSet<&String> = placed.iter().collect();
    assert_eq!(unique.len(), placed.len());
    assert_eq!(
        shop.service
            .list_orders(&shop.admin, &OrderFilter::default())?
            .len(),
        placed.len()
    );

    Ok(())
}

#[test]
fn failed_checkouts_do_not_consume_order_numbers() -> anyhow::Result<()> {
    let shop = shop("order_number_gaps.db")?;
    let product = red_runner(&shop, 1)?;

    for _ in 0..3 {
        let result = shop.service.create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 2)], PaymentMethod::CashOnDelivery),
        );
        assert!(matches!(result, Err(OrderError::InsufficientStock { .. })));
    }

    let receipt = shop.service.create_order(
        &shop.customer,
        checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
    )?;
    assert!(receipt.order.order_number.ends_with("-000001"));

    let counter_sale = shop.service.create_pos_order(
        &shop.admin,
        CounterSale {
            items: vec![item(&product, "Black", "41", 1)],
            customer_email: None,
            payment_method: PaymentMethod::Cash,
            payment_reference: None,
            discount: 0,
        },
    )?;
    assert!(counter_sale.order.order_number.ends_with("-000002"));

    Ok(())
}

#[test]
fn archived_orders_are_frozen_until_unarchived() -> anyhow::Result<()> {
    let shop = shop("archived_frozen.db")?;
    let product = red_runner(&shop, 5)?;
    let order_id = shop
        .service
        .create_order(
            &shop.customer,
            checkout(vec![item(&product, "Red", "42", 1)], PaymentMethod::CashOnDelivery),
        )?
        .order
        .id;
    shop.service.archive_order(&shop.admin, &order_id)?;

    let result = shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Confirmed),
    );
    assert!(matches!(result, Err(OrderError::InvalidState(_))));
    let result = shop
        .service
        .request_cancellation(&shop.customer, &order_id, "changed my mind");
    assert!(matches!(result, Err(OrderError::InvalidState(_))));

    let frozen = shop.service.get_order(&shop.admin, &order_id)?.order;
    assert_eq!(frozen.status, OrderStatus::Pending);
    assert_eq!(shop.service.order_history(&shop.admin, &order_id)?.events.len(), 1);

    shop.service.unarchive_order(&shop.admin, &order_id)?;
    let confirmed = shop.service.admin_update_status(
        &shop.admin,
        &order_id,
        StatusUpdate::to(OrderStatus::Confirmed),
    )?;
    assert_eq!(confirmed.status, OrderStatus::Confirmed);

    Ok(())
}
