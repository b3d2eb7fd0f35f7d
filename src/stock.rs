//! Per-variant stock ledger
//!
//! A product's `variants` map is the source of truth; `stock_quantity` is a
//! read cache for listings and is only ever written by [`Product::recompute_stock`].
use super::error::OrderError;
use super::store::{Store, abort, decode, encode};
use super::types::TimeStamp;
use super::utils::new_uuid_to_bech32;
use chrono::Utc;
use sled::transaction::ConflictableTransactionResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// color -> size -> quantity on hand
pub type VariantMap = BTreeMap<String, BTreeMap<String, u32>>;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Product {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub price: i64, // centavos
    #[n(3)]
    variants: VariantMap,
    #[n(4)]
    stock_quantity: u64,
    #[n(5)]
    pub updated_at: TimeStamp<Utc>,
}

impl Product {
    pub fn new(id: String, name: String, price: i64) -> Self {
        Self {
            id,
            name,
            price,
            variants: VariantMap::new(),
            stock_quantity: 0,
            updated_at: TimeStamp::new(),
        }
    }
    pub fn with_variant(mut self, color: &str, size: &str, quantity: u32) -> Self {
        self.set_quantity(color, size, quantity);
        self
    }
    pub fn variants(&self) -> &VariantMap {
        &self.variants
    }
    pub fn stock_quantity(&self) -> u64 {
        self.stock_quantity
    }
    pub fn available(&self, color: &str, size: &str) -> u32 {
        self.variants
            .get(color)
            .and_then(|sizes| sizes.get(size))
            .copied()
            .unwrap_or(0)
    }
    /// Sum of every leaf quantity in the variant map.
    pub fn variant_total(&self) -> u64 {
        self.variants
            .values()
            .flat_map(|sizes| sizes.values())
            .map(|qty| u64::from(*qty))
            .sum()
    }
    /// Decrement a variant. Fails without touching the product when short.
    pub fn take(&mut self, color: &str, size: &str, quantity: u32) -> Result<(), OrderError> {
        let available = self.available(color, size);
        if quantity > available {
            return Err(OrderError::InsufficientStock {
                product_id: self.id.clone(),
                color: color.to_string(),
                size: size.to_string(),
                requested: quantity,
                available,
            });
        }
        self.set_quantity(color, size, available - quantity);
        Ok(())
    }
    /// Increment a variant, creating missing color/size keys at zero first.
    pub fn put(&mut self, color: &str, size: &str, quantity: u32) {
        let current = self.available(color, size);
        self.set_quantity(color, size, current.saturating_add(quantity));
    }
    pub fn set_quantity(&mut self, color: &str, size: &str, quantity: u32) {
        self.variants
            .entry(color.to_string())
            .or_default()
            .insert(size.to_string(), quantity);
        self.recompute_stock();
    }
    fn recompute_stock(&mut self) {
        self.stock_quantity = self.variant_total();
        self.updated_at = TimeStamp::new();
    }
}

/// One variant quantity to move in or out of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: String,
    pub color: String,
    pub size: String,
    pub quantity: u32,
}

/// Outcome of a best-effort restoration over several lines.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: Vec<(String, String)>, // (product_id, error)
}

#[derive(Clone)]
pub struct StockLedger {
    store: Arc<Store>,
}

impl StockLedger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn get_product(&self, product_id: &str) -> Result<Product, OrderError> {
        self.store.product(product_id)
    }

    /// Register a new product with an initial variant map.
    pub fn create_product(
        &self,
        name: String,
        price: i64,
        variants: VariantMap,
    ) -> Result<Product, OrderError> {
        if name.trim().is_empty() {
            return Err(OrderError::Validation("product name is required".into()));
        }
        if price < 0 {
            return Err(OrderError::Validation("price cannot be negative".into()));
        }
        let id = new_uuid_to_bech32("product_").map_err(|e| OrderError::Codec(e.to_string()))?;
        let mut product = Product::new(id, name, price);
        for (color, sizes) in variants {
            for (size, quantity) in sizes {
                product.set_quantity(&color, &size, quantity);
            }
        }
        self.store.put_product(&product)?;
        info!(product_id = %product.id, stock = product.stock_quantity(), "Product created");
        Ok(product)
    }

    /// Overwrite one variant's quantity, as an admin stock count would.
    pub fn set_variant_quantity(
        &self,
        product_id: &str,
        color: &str,
        size: &str,
        quantity: u32,
    ) -> Result<Product, OrderError> {
        self.mutate(product_id, |product| {
            product.set_quantity(color, size, quantity);
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn reserve_stock(
        &self,
        product_id: &str,
        color: &str,
        size: &str,
        quantity: u32,
    ) -> Result<Product, OrderError> {
        self.mutate(product_id, |product| product.take(color, size, quantity))
    }

    #[instrument(skip(self))]
    pub fn restore_stock(
        &self,
        product_id: &str,
        color: &str,
        size: &str,
        quantity: u32,
    ) -> Result<Product, OrderError> {
        self.mutate(product_id, |product| {
            product.put(color, size, quantity);
            Ok(())
        })
    }

    /// Reserve every line or none of them.
    ///
    /// All lines are applied inside a single transaction on the products
    /// tree, so a shortage on any line aborts before anything is written and
    /// concurrent reservations of the same variant are serialised.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub fn reserve_lines(&self, lines: &[StockLine]) -> Result<(), OrderError> {
        for line in lines {
            if line.quantity == 0 {
                return Err(OrderError::Validation(format!(
                    "quantity for {} must be positive",
                    line.product_id
                )));
            }
        }
        self.store
            .products
            .transaction(|tx| -> ConflictableTransactionResult<(), OrderError> {
                for line in lines {
                    let bytes = tx
                        .get(line.product_id.as_bytes())?
                        .ok_or_else(|| abort(OrderError::product_not_found(&line.product_id)))?;
                    let mut product: Product = decode(&bytes).map_err(abort)?;
                    product
                        .take(&line.color, &line.size, line.quantity)
                        .map_err(abort)?;
                    tx.insert(line.product_id.as_bytes(), encode(&product).map_err(abort)?)?;
                }
                Ok(())
            })
            .map_err(OrderError::from)?;
        debug!("Stock reserved");
        Ok(())
    }

    /// Put every line back, one transaction per line. A failing line is
    /// logged and skipped so the rest are still restored.
    pub fn restore_lines(&self, lines: &[StockLine]) -> RestoreReport {
        let mut report = RestoreReport::default();
        for line in lines {
            match self.restore_stock(&line.product_id, &line.color, &line.size, line.quantity) {
                Ok(_) => report.restored += 1,
                Err(e) => {
                    warn!(product_id = %line.product_id, error = %e, "Failed to restore stock, skipping");
                    report.failed.push((line.product_id.clone(), e.to_string()));
                }
            }
        }
        report
    }

    fn mutate(
        &self,
        product_id: &str,
        apply: impl Fn(&mut Product) -> Result<(), OrderError>,
    ) -> Result<Product, OrderError> {
        let product = self
            .store
            .products
            .transaction(|tx| -> ConflictableTransactionResult<Product, OrderError> {
                let bytes = tx
                    .get(product_id.as_bytes())?
                    .ok_or_else(|| abort(OrderError::product_not_found(product_id)))?;
                let mut product: Product = decode(&bytes).map_err(abort)?;
                apply(&mut product).map_err(abort)?;
                tx.insert(product_id.as_bytes(), encode(&product).map_err(abort)?)?;
                Ok(product)
            })
            .map_err(OrderError::from)?;
        Ok(product)
    }
}
