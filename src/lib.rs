pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod notify;
pub mod order;
pub mod pricing;
pub mod retention;
pub mod service;
pub mod stock;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use error::{OrderError, TransitionError};
pub use order::{Order, OrderItem, OrderStatus};
pub use service::OrderService;
pub use store::Store;
