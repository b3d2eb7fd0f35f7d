//! Server-side order totals
//!
//! Amounts are integer centavos. Tax is `subtotal * rate` rounded half up to
//! the centavo; shipping is a quantity tier plus an optional region surcharge.
use super::error::OrderError;
use super::order::Totals;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShippingTier {
    pub max_quantity: u32,
    pub fee: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingConfig {
    /// 1200 = 12%
    pub tax_rate_bps: i64,
    /// ascending by `max_quantity`; quantities past the last tier pay its fee
    pub shipping_tiers: Vec<ShippingTier>,
    /// lowercase region name -> surcharge
    pub region_surcharges: BTreeMap<String, i64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tax_rate_bps: 1200,
            shipping_tiers: vec![
                ShippingTier {
                    max_quantity: 2,
                    fee: 10_000,
                },
                ShippingTier {
                    max_quantity: 5,
                    fee: 15_000,
                },
                ShippingTier {
                    max_quantity: u32::MAX,
                    fee: 20_000,
                },
            ],
            region_surcharges: BTreeMap::from([
                ("visayas".to_string(), 5_000),
                ("mindanao".to_string(), 10_000),
            ]),
        }
    }
}

/// A priced line: unit price in centavos and quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedLine {
    pub unit_price: i64,
    pub quantity: u32,
}

fn overflow() -> OrderError {
    OrderError::Validation("order amount is too large".into())
}

impl PricedLine {
    pub fn line_total(&self) -> Result<i64, OrderError> {
        self.unit_price
            .checked_mul(i64::from(self.quantity))
            .ok_or_else(overflow)
    }
}

impl PricingConfig {
    pub fn tax_on(&self, subtotal: i64) -> Result<i64, OrderError> {
        subtotal
            .checked_mul(self.tax_rate_bps)
            .and_then(|scaled| scaled.checked_add(5_000))
            .map(|scaled| scaled.div_euclid(10_000))
            .ok_or_else(overflow)
    }

    pub fn shipping_for(&self, quantity: u32, region: Option<&str>) -> i64 {
        let base = self
            .shipping_tiers
            .iter()
            .find(|tier| quantity <= tier.max_quantity)
            .or(self.shipping_tiers.last())
            .map(|tier| tier.fee)
            .unwrap_or(0);
        let surcharge = region
            .map(|r| r.trim().to_ascii_lowercase())
            .and_then(|r| self.region_surcharges.get(&r).copied())
            .unwrap_or(0);
        base.saturating_add(surcharge)
    }

    /// Totals for an online order shipped to `region`.
    pub fn quote(&self, lines: &[PricedLine], region: Option<&str>) -> Result<Totals, OrderError> {
        let quantity = lines
            .iter()
            .try_fold(0u32, |sum, line| sum.checked_add(line.quantity))
            .ok_or_else(|| OrderError::Validation("too many items in one order".into()))?;
        self.assemble(lines, self.shipping_for(quantity, region), 0)
    }

    /// Totals for a counter sale: no shipping, optional discount.
    pub fn quote_counter_sale(&self, lines: &[PricedLine], discount: i64) -> Result<Totals, OrderError> {
        self.assemble(lines, 0, discount)
    }

    fn assemble(&self, lines: &[PricedLine], shipping: i64, discount: i64) -> Result<Totals, OrderError> {
        if lines.is_empty() {
            return Err(OrderError::Validation("an order needs at least one item".into()));
        }
        if discount < 0 {
            return Err(OrderError::Validation("discount cannot be negative".into()));
        }
        let mut subtotal: i64 = 0;
        for line in lines {
            subtotal = subtotal.checked_add(line.line_total()?).ok_or_else(overflow)?;
        }
        let tax = self.tax_on(subtotal)?;
        let gross = subtotal
            .checked_add(tax)
            .and_then(|amount| amount.checked_add(shipping))
            .ok_or_else(overflow)?;
        if discount > gross {
            return Err(OrderError::Validation(
                "discount exceeds the order amount".into(),
            ));
        }
        Ok(Totals {
            subtotal,
            tax,
            shipping,
            discount,
            total: gross - discount,
        })
    }
}
