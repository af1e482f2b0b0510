//! Query execution: the single-worker engine, its request/response value
//! objects, the shared result table and the paged projection over it.

pub mod executor;
pub mod paged;
pub mod request;
pub mod table;

pub use executor::{EventSender, ExecutionEvent, SqlExecutor};
pub use paged::{PagedView, TableSupplier};
pub use request::{ExecutionRequest, ExecutionResponse};
pub use table::{ResultTable, Row, ROWID_COL_NAME};
