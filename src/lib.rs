pub mod compactor;
pub mod config;
pub mod engine;
pub mod http;
pub mod index;
pub mod limits;
pub mod model;
pub mod observability;
pub mod recurrence;
pub mod tenant;
pub mod wal;
