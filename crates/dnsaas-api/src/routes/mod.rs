//! API Routes

pub mod availability;
pub mod breakers;
pub mod deployments;
pub mod health;
pub mod load_balancers;
pub mod scaling_groups;
pub mod zones;
