//! Order lifecycle graph
//!
//! ```text
//! pending -> confirmed -> processing -> shipped -> delivered -> returned
//!    \____________\____________\____________\
//!                 |                          |
//!          cancelled (staff)     pending_cancellation (customer)
//!                                   |-- approve --> cancelled
//!                                   `-- reject  --> processing
//! ```
//!
//! Every status change of a stored order goes through [`next_status`]. The
//! initial status is set at creation instead: `pending` for online checkout,
//! `delivered` for a counter sale. `Store::put_order` is a raw record write
//! for imports and fixtures and bypasses the graph.
use super::error::TransitionError;
use super::order::OrderStatus;

/// Who is asking for the change. Routes decide this, not the token: the
/// customer order route always acts as `Customer`, the admin route as `Staff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Customer,
    Staff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move one step along the happy path.
    Advance(OrderStatus),
    /// Direct cancellation by staff.
    Cancel,
    RequestCancellation,
    ApproveCancellation,
    /// Resolve a request by sending the order back to `restore_to`.
    RejectCancellation { restore_to: OrderStatus },
    ConfirmReturn,
}

impl Transition {
    /// Maps a plain status update onto the transition that produces it.
    pub fn for_target(target: OrderStatus) -> Self {
        match target {
            OrderStatus::Cancelled => Transition::Cancel,
            OrderStatus::PendingCancellation => Transition::RequestCancellation,
            OrderStatus::Returned => Transition::ConfirmReturn,
            other => Transition::Advance(other),
        }
    }
}

pub fn next_status(
    from: OrderStatus,
    transition: &Transition,
    actor: Actor,
) -> Result<OrderStatus, TransitionError> {
    let next = match (transition, actor) {
        // delivery is only ever confirmed by the customer receiving the parcel
        (Transition::Advance(OrderStatus::Delivered), Actor::Customer)
            if from == OrderStatus::Shipped =>
        {
            Some(OrderStatus::Delivered)
        }
        (Transition::Advance(to), Actor::Staff)
            if *to != OrderStatus::Delivered && from.successor() == Some(*to) =>
        {
            Some(*to)
        }
        (Transition::Cancel, Actor::Staff) if from.is_cancellable() => Some(OrderStatus::Cancelled),
        (Transition::RequestCancellation, Actor::Customer) if from.is_cancellable() => {
            Some(OrderStatus::PendingCancellation)
        }
        (Transition::ApproveCancellation, Actor::Staff)
            if from == OrderStatus::PendingCancellation =>
        {
            Some(OrderStatus::Cancelled)
        }
        (Transition::RejectCancellation { restore_to }, Actor::Staff)
            if from == OrderStatus::PendingCancellation && restore_to.is_cancellable() =>
        {
            Some(*restore_to)
        }
        (Transition::ConfirmReturn, _) if from == OrderStatus::Delivered => {
            Some(OrderStatus::Returned)
        }
        _ => None,
    };

    next.ok_or_else(|| TransitionError {
        from,
        transition: transition.clone(),
        actor,
    })
}
