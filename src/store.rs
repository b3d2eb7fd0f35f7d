//! sled-backed persistence for orders, items, products and their dependents
//!
//! Trees and key layout:
//!
//! | tree                     | key                              | value                  |
//! |--------------------------|----------------------------------|------------------------|
//! | `orders`                 | `order_id`                       | [`Order`]              |
//! | `order_items`            | `order_id/index`                 | [`OrderItem`]          |
//! | `order_history`          | `order_id/sequence`              | [`StatusEvent`]        |
//! | `delivery_notifications` | `order_id/notification_id`       | [`DeliveryNotification`] |
//! | `notification_views`     | `notification_id/user_id`        | [`NotificationView`]   |
//! | `products`               | `product_id`                     | [`Product`]            |
//! | `meta`                   | `order_seq/year`                 | big-endian `u64`       |
use super::error::OrderError;
use super::history::StatusEvent;
use super::notify::{DeliveryNotification, NotificationView};
use super::order::{Order, OrderItem};
use super::stock::Product;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Tree};
use std::path::Path;

pub struct Store {
    db: Db,
    pub(crate) orders: Tree,
    pub(crate) items: Tree,
    pub(crate) products: Tree,
    pub(crate) history: Tree,
    pub(crate) notifications: Tree,
    pub(crate) views: Tree,
    meta: Tree,
}

/// Keys of every row hanging off one order.
#[derive(Debug, Default, Clone)]
pub(crate) struct Dependents {
    pub items: Vec<Vec<u8>>,
    pub history: Vec<Vec<u8>>,
    pub notifications: Vec<Vec<u8>>,
    pub views: Vec<Vec<u8>>,
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, OrderError> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, OrderError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

pub(crate) fn abort(err: OrderError) -> ConflictableTransactionError<OrderError> {
    ConflictableTransactionError::Abort(err)
}

pub(crate) fn child_key(parent: &str, child: &str) -> String {
    format!("{parent}/{child}")
}

pub(crate) fn item_key(order_id: &str, index: usize) -> String {
    child_key(order_id, &format!("{index:04}"))
}

pub(crate) fn history_key(order_id: &str, sequence: u32) -> String {
    child_key(order_id, &format!("{sequence:06}"))
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OrderError> {
        Self::from_db(sled::open(path)?)
    }

    pub fn from_db(db: Db) -> Result<Self, OrderError> {
        Ok(Self {
            orders: db.open_tree("orders")?,
            items: db.open_tree("order_items")?,
            products: db.open_tree("products")?,
            history: db.open_tree("order_history")?,
            notifications: db.open_tree("delivery_notifications")?,
            views: db.open_tree("notification_views")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), OrderError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> Result<Option<Order>, OrderError> {
        self.orders
            .get(order_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn order(&self, order_id: &str) -> Result<Order, OrderError> {
        self.get_order(order_id)?
            .ok_or_else(|| OrderError::order_not_found(order_id))
    }

    /// Raw write of an order record, bypassing the lifecycle graph. Meant for
    /// imports and fixtures; status changes go through the service.
    pub fn put_order(&self, order: &Order) -> Result<(), OrderError> {
        self.orders.insert(order.id.as_bytes(), encode(order)?)?;
        Ok(())
    }

    /// Read-modify-write of one order record inside a transaction.
    pub(crate) fn update_order(
        &self,
        order_id: &str,
        apply: impl Fn(&mut Order) -> Result<(), OrderError>,
    ) -> Result<Order, OrderError> {
        self.orders
            .transaction(|tx| -> ConflictableTransactionResult<Order, OrderError> {
                let bytes = tx
                    .get(order_id.as_bytes())?
                    .ok_or_else(|| abort(OrderError::order_not_found(order_id)))?;
                let mut order: Order = decode(&bytes).map_err(abort)?;
                apply(&mut order).map_err(abort)?;
                tx.insert(order_id.as_bytes(), encode(&order).map_err(abort)?)?;
                Ok(order)
            })
            .map_err(OrderError::from)
    }

    pub fn orders(&self) -> Result<Vec<Order>, OrderError> {
        self.scan_orders().into_iter().map(|(_, order)| order).collect()
    }

    /// Every order keyed by id, with decode failures reported per record.
    pub fn scan_orders(&self) -> Vec<(String, Result<Order, OrderError>)> {
        self.orders
            .iter()
            .map(|entry| match entry {
                Ok((key, value)) => (
                    String::from_utf8_lossy(&key).into_owned(),
                    decode::<Order>(&value),
                ),
                Err(e) => (String::new(), Err(OrderError::Storage(e))),
            })
            .collect()
    }

    pub fn order_items(&self, order_id: &str) -> Result<Vec<OrderItem>, OrderError> {
        scan_children(&self.items, order_id)
    }

    pub fn history(&self, order_id: &str) -> Result<Vec<StatusEvent>, OrderError> {
        scan_children(&self.history, order_id)
    }

    /// Persist a new order with its items and creation event in one transaction.
    pub fn insert_order(
        &self,
        order: &mut Order,
        items: &[OrderItem],
        actor_id: &str,
    ) -> Result<(), OrderError> {
        let event = StatusEvent::new(
            order.id.clone(),
            actor_id.to_string(),
            None,
            order.status,
            None,
        )
        .chained(0, None);
        let (digest, event_cbor) = event.build()?;
        order.history_len = 1;
        order.history_head = Some(digest);

        let order_cbor = encode(&*order)?;
        let item_rows = items
            .iter()
            .enumerate()
            .map(|(index, item)| Ok((item_key(&order.id, index), encode(item)?)))
            .collect::<Result<Vec<_>, OrderError>>()?;
        let order_id = order.id.as_str();

        (&self.orders, &self.items, &self.history)
            .transaction(
                |(tx_orders, tx_items, tx_history)| -> ConflictableTransactionResult<(), OrderError> {
                    if tx_orders.get(order_id.as_bytes())?.is_some() {
                        return Err(abort(OrderError::InvalidState(format!(
                            "order {order_id} already exists"
                        ))));
                    }
                    tx_orders.insert(order_id.as_bytes(), order_cbor.clone())?;
                    for (key, value) in &item_rows {
                        tx_items.insert(key.as_bytes(), value.clone())?;
                    }
                    tx_history.insert(history_key(order_id, 0).as_bytes(), event_cbor.clone())?;
                    Ok(())
                },
            )
            .map_err(OrderError::from)
    }

    /// Allocate the next `GK-<year>-<seq>` order number; sequences restart each year.
    /// A number handed out for an order that then fails to persist is not reused.
    pub fn next_order_number(&self, year: i32) -> Result<String, OrderError> {
        let key = format!("order_seq/{year}");
        let bytes = self
            .meta
            .update_and_fetch(key.as_bytes(), |old| {
                let current = old.map(read_counter).unwrap_or(0);
                Some((current + 1).to_be_bytes().to_vec())
            })?
            .ok_or_else(|| OrderError::Codec("order sequence vanished".into()))?;
        Ok(format!("GK-{year}-{:06}", read_counter(&bytes)))
    }

    pub fn get_product(&self, product_id: &str) -> Result<Option<Product>, OrderError> {
        self.products
            .get(product_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn product(&self, product_id: &str) -> Result<Product, OrderError> {
        self.get_product(product_id)?
            .ok_or_else(|| OrderError::product_not_found(product_id))
    }

    pub fn put_product(&self, product: &Product) -> Result<(), OrderError> {
        self.products
            .insert(product.id.as_bytes(), encode(product)?)?;
        Ok(())
    }

    pub fn notifications(&self) -> Result<Vec<DeliveryNotification>, OrderError> {
        self.notifications
            .iter()
            .map(|entry| decode(&entry?.1))
            .collect()
    }

    pub fn notifications_for(&self, order_id: &str) -> Result<Vec<DeliveryNotification>, OrderError> {
        scan_children(&self.notifications, order_id)
    }

    pub fn notification(
        &self,
        order_id: &str,
        notification_id: &str,
    ) -> Result<Option<DeliveryNotification>, OrderError> {
        self.notifications
            .get(child_key(order_id, notification_id).as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn put_view(&self, view: &NotificationView) -> Result<(), OrderError> {
        let key = child_key(&view.notification_id, &view.user_id);
        self.views.insert(key.as_bytes(), encode(view)?)?;
        Ok(())
    }

    pub fn views_for(&self, notification_id: &str) -> Result<Vec<NotificationView>, OrderError> {
        scan_children(&self.views, notification_id)
    }

    /// Collect the keys of every dependent row of an order.
    pub(crate) fn dependents(&self, order_id: &str) -> Result<Dependents, OrderError> {
        let mut dependents = Dependents {
            items: child_keys(&self.items, order_id)?,
            history: child_keys(&self.history, order_id)?,
            ..Dependents::default()
        };
        for notification in self.notifications_for(order_id)? {
            dependents
                .notifications
                .push(child_key(order_id, &notification.id).into_bytes());
            dependents
                .views
                .extend(child_keys(&self.views, &notification.id)?);
        }
        Ok(dependents)
    }
}

fn read_counter(bytes: &[u8]) -> u64 {
    <[u8; 8]>::try_from(bytes)
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn scan_children<T>(tree: &Tree, parent: &str) -> Result<Vec<T>, OrderError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    tree.scan_prefix(child_key(parent, "").as_bytes())
        .map(|entry| decode(&entry?.1))
        .collect()
}

fn child_keys(tree: &Tree, parent: &str) -> Result<Vec<Vec<u8>>, OrderError> {
    tree.scan_prefix(child_key(parent, "").as_bytes())
        .keys()
        .map(|key| Ok(key?.to_vec()))
        .collect()
}
