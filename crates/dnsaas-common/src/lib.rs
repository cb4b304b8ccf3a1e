//! DNSaaS Common - shared types for the availability & traffic management core
//!
//! - Error taxonomy with stable codes
//! - Injectable clock
//! - Swappable record store
//! - Typed ids

#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::*;
pub use store::{MemoryStore, Store};

use uuid::Uuid;

/// Availability zone id
pub type ZoneId = Uuid;
/// Service instance id
pub type InstanceId = Uuid;
/// Load-balancer target id
pub type TargetId = Uuid;
/// Load balancer id
pub type LoadBalancerId = Uuid;
/// Scaling group id
pub type GroupId = Uuid;
/// Scaling policy id
pub type PolicyId = Uuid;
/// Deployment session id
pub type DeploymentId = Uuid;
