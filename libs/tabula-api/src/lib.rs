pub mod error;
pub mod fields;
pub mod manager;
pub mod table;
pub mod types;

pub use error::{ErrorKind, SchemaError, TableError};
pub use fields::{BatchHeader, Field, Fields};
pub use manager::{BoxFuture, TableManager};
pub use table::{ColumnType, TableSchema};
pub use types::{DataType, widen_all};
