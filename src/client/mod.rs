//! Clients for the dependencies the upgrade engine watches.
//!
//! - `location`: whether the operator runs inside the cluster it manages
//! - `rabbitmq`: RabbitMQ management API access and queue depth reads

pub mod location;
pub mod rabbitmq;

pub use location::{LocationError, detect_location};
pub use rabbitmq::{QueueStats, QueueStatsError, RabbitMqAccess, RabbitMqManagement};
