//! Background Tasks Module
//!
//! Contains background tasks that run periodically while the cache is in
//! service.
//!
//! # Tasks
//! - Maintenance: sweeps expired items and compacts providers at
//!   configured intervals

mod maintenance;

pub use maintenance::spawn_maintenance_task;
