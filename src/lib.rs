pub mod coll;
pub mod comm;
pub mod config;
pub mod device;
pub mod registry;
pub mod sched;
