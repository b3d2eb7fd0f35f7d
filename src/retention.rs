//! Periodic archiving and hard deletion of completed orders
//!
//! Two passes run in order. The archive pass stamps `archived_at` on
//! delivered or cancelled orders whose completion is older than
//! [`RetentionPolicy::archive_after`]; the delete pass removes orders archived
//! longer than [`RetentionPolicy::delete_after`] together with every row that
//! hangs off them. Both passes work order by order: one failure is recorded
//! in the summary and the pass moves on.
use super::error::OrderError;
use super::order::Order;
use super::store::{Dependents, Store, abort, decode};
use super::types::TimeStamp;
use chrono::{TimeDelta, Utc};
use sled::Transactional;
use sled::transaction::ConflictableTransactionResult;
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub archive_after: TimeDelta,
    pub delete_after: TimeDelta,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            archive_after: TimeDelta::days(365),
            delete_after: TimeDelta::days(3 * 365),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPass {
    Archive,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionFailure {
    pub order_id: String,
    pub pass: RetentionPass,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub archived: usize,
    pub deleted: usize,
    pub errors: Vec<RetentionFailure>,
    pub duration: Duration,
}

impl RetentionSummary {
    pub fn log(&self) {
        for failure in &self.errors {
            warn!(
                order_id = %failure.order_id,
                pass = ?failure.pass,
                error = %failure.error,
                "Retention step failed"
            );
        }
        info!(
            archived = self.archived,
            deleted = self.deleted,
            errors = self.errors.len(),
            duration_ms = self.duration.as_millis(),
            "Retention run finished"
        );
    }
}

pub struct RetentionJob {
    store: Arc<Store>,
    policy: RetentionPolicy,
}

impl RetentionJob {
    pub fn new(store: Arc<Store>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn run(&self) -> RetentionSummary {
        self.run_at(&TimeStamp::new())
    }

    /// Run both passes as if the current time were `now`.
    pub fn run_at(&self, now: &TimeStamp<Utc>) -> RetentionSummary {
        let started = Instant::now();
        let mut summary = RetentionSummary::default();

        self.archive_pass(now, &mut summary);
        self.delete_pass(now, &mut summary);

        summary.duration = started.elapsed();
        summary
    }

    fn archive_pass(&self, now: &TimeStamp<Utc>, summary: &mut RetentionSummary) {
        let cutoff = now.minus(self.policy.archive_after);
        for (order_id, record) in self.store.scan_orders() {
            let order = match record {
                Ok(order) => order,
                Err(e) => {
                    summary.errors.push(failure(order_id, RetentionPass::Archive, e));
                    continue;
                }
            };
            if !due_for_archive(&order, &cutoff) {
                continue;
            }
            match self.archive(&order.id, &cutoff) {
                Ok(true) => {
                    debug!(order_id = %order.id, "Order archived by retention");
                    summary.archived += 1;
                }
                // changed since the scan
                Ok(false) => {}
                Err(e) => summary.errors.push(failure(order.id, RetentionPass::Archive, e)),
            }
        }
    }

    fn archive(&self, order_id: &str, cutoff: &TimeStamp<Utc>) -> Result<bool, OrderError> {
        let applied = Cell::new(false);
        self.store.update_order(order_id, |order| {
            applied.set(due_for_archive(order, cutoff));
            if applied.get() {
                order.archived_at = order.completed_at().cloned();
            }
            Ok(())
        })?;
        Ok(applied.get())
    }

    fn delete_pass(&self, now: &TimeStamp<Utc>, summary: &mut RetentionSummary) {
        let cutoff = now.minus(self.policy.delete_after);
        for (order_id, record) in self.store.scan_orders() {
            let order = match record {
                Ok(order) => order,
                Err(e) => {
                    summary.errors.push(failure(order_id, RetentionPass::Delete, e));
                    continue;
                }
            };
            if !due_for_delete(&order, &cutoff) {
                continue;
            }
            match self.delete(&order.id, &cutoff) {
                Ok(true) => {
                    info!(order_id = %order.id, order_number = %order.order_number, "Order deleted by retention");
                    summary.deleted += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(order_id = %order.id, error = %e, "Failed to delete order");
                    summary.errors.push(failure(order.id, RetentionPass::Delete, e));
                }
            }
        }
    }

    /// Remove the order and its items, history, notifications and views in
    /// one transaction. Returns `false` if the order no longer qualifies.
    fn delete(&self, order_id: &str, cutoff: &TimeStamp<Utc>) -> Result<bool, OrderError> {
        // transactional trees cannot scan, so dependents are collected first
        let Dependents {
            items,
            history,
            notifications,
            views,
        } = self.store.dependents(order_id)?;

        (
            &self.store.orders,
            &self.store.items,
            &self.store.history,
            &self.store.notifications,
            &self.store.views,
        )
            .transaction(
                |(tx_orders, tx_items, tx_history, tx_notifications, tx_views)| -> ConflictableTransactionResult<bool, OrderError> {
                    let Some(bytes) = tx_orders.get(order_id.as_bytes())? else {
                        return Ok(false);
                    };
                    let order: Order = decode(&bytes).map_err(abort)?;
                    if !due_for_delete(&order, cutoff) {
                        return Ok(false);
                    }
                    for key in &views {
                        tx_views.remove(key.as_slice())?;
                    }
                    for key in &notifications {
                        tx_notifications.remove(key.as_slice())?;
                    }
                    for key in &history {
                        tx_history.remove(key.as_slice())?;
                    }
                    for key in &items {
                        tx_items.remove(key.as_slice())?;
                    }
                    tx_orders.remove(order_id.as_bytes())?;
                    Ok(true)
                },
            )
            .map_err(OrderError::from)
    }
}

fn due_for_archive(order: &Order, cutoff: &TimeStamp<Utc>) -> bool {
    !order.is_archived() && order.completed_at().is_some_and(|at| at < cutoff)
}

fn due_for_delete(order: &Order, cutoff: &TimeStamp<Utc>) -> bool {
    order.archived_at.as_ref().is_some_and(|at| at < cutoff)
}

fn failure(order_id: String, pass: RetentionPass, error: OrderError) -> RetentionFailure {
    RetentionFailure {
        order_id,
        pass,
        error: error.to_string(),
    }
}

/// Run `job` every `period` on the blocking pool until the handle is aborted.
/// The first run starts immediately.
pub fn spawn_scheduler(job: Arc<RetentionJob>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(period);
        interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval_timer.tick().await;
            let job = job.clone();
            match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(summary) => summary.log(),
                Err(e) => error!(error = %e, "Retention run panicked"),
            }
        }
    })
}
