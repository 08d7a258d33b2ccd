//! Infrastructure layer: stores, job queues, workers, cache and gateways.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod gateways;
pub mod jobs;
pub mod service;
pub mod store;
pub mod workers;


pub use config::{ConfigError, ServiceConfig};
pub use dispatch::{DispatchError, Dispatched, TicketDispatcher};
pub use service::{ServiceError, ServiceSettings, TicketService};
pub use workers::WorkerPool;
