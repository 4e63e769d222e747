//! Schema reconciliation: turn an inferred [`BatchHeader`](tabula_api::BatchHeader)
//! into a destination table that is guaranteed to hold every column, with
//! DDL serialized across the fleet through a
//! [`CoordinationService`](tabula_coordination::CoordinationService).

pub mod config;
pub mod error;
pub mod helper;

pub use config::{ColumnNameStyle, DestinationConfig, TypeMapping};
pub use error::EnsureTableError;
pub use helper::TableHelper;
