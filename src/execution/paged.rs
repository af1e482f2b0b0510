//! Windowed, lazily-revealed projection over a live `ResultTable`.
//!
//! The view decouples "rows fetched so far" from "rows currently
//! rendered": bounds are recomputed on `refresh`, never pushed by the
//! table, so a fast-growing result cannot flood the display layer. The
//! `flushed` latch is the second half of the backpressure design — a
//! table that outgrows one page triggers a single full redisplay at the
//! crossing, after which growth inside the current page is silent until
//! the caller pages or forces a refresh.

use std::sync::Arc;

use serde_json::Value;

use crate::driver::{SqlType, SqlValue};
use crate::execution::table::ResultTable;

/// Yields the table currently bound to the view. The table is built by
/// the executor, so this returns `None` until a first execution starts,
/// and a different instance after every resubmission.
pub type TableSupplier = Box<dyn Fn() -> Option<Arc<ResultTable>> + Send + Sync>;

pub struct PagedView {
    page_size: usize,
    supplier: TableSupplier,
    current_page: usize,
    max_page: usize,
    page_start: usize,
    page_end: usize,
    flushed: bool,
}

impl PagedView {
    pub fn new(page_size: usize, supplier: TableSupplier) -> Self {
        Self {
            page_size: page_size.max(1),
            supplier,
            current_page: 0,
            max_page: 0,
            page_start: 0,
            page_end: 0,
            flushed: false,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn max_page(&self) -> usize {
        self.max_page
    }

    /// Offset of the current page into the table, inclusive.
    pub fn page_start(&self) -> usize {
        self.page_start
    }

    /// Offset one past the last row of the current page, clamped to the
    /// table size at the last refresh.
    pub fn page_end(&self) -> usize {
        self.page_end
    }

    pub fn can_advance(&self) -> bool {
        self.current_page < self.max_page
    }

    pub fn can_retreat(&self) -> bool {
        self.current_page > 0
    }

    /// Move forward one page. No-op past the last page. Returns whether
    /// the caller should redisplay.
    pub fn advance(&mut self) -> bool {
        if self.can_advance() {
            self.current_page += 1;
            self.refresh(true)
        } else {
            false
        }
    }

    /// Move back one page. No-op before the first page.
    pub fn retreat(&mut self) -> bool {
        if self.can_retreat() {
            self.current_page -= 1;
            self.refresh(true)
        } else {
            false
        }
    }

    /// Recompute page bounds from the bound table's live row count.
    /// Returns whether the caller should run a full redisplay: always
    /// when forced, otherwise only on the first crossing of the
    /// page-size threshold.
    pub fn refresh(&mut self, force: bool) -> bool {
        let size = match (self.supplier)() {
            Some(table) => {
                let size = table.row_count();
                self.max_page = if size == 0 {
                    0
                } else {
                    (size - 1) / self.page_size
                };
                if self.current_page > self.max_page {
                    self.current_page = self.max_page;
                }
                self.page_start = (self.page_size * self.current_page).min(size);
                self.page_end = (self.page_start + self.page_size).min(size);
                size
            }
            None => {
                self.current_page = 0;
                self.max_page = 0;
                self.page_start = 0;
                self.page_end = 0;
                0
            }
        };
        // re-arm the latch whenever the bound table fits in one page
        // again (a fresh execution starts from an empty table)
        if size <= self.page_size {
            self.flushed = false;
        }
        if force || (!self.flushed && size > self.page_size) {
            self.flushed = true;
            return true;
        }
        false
    }

    /// Rows on the current page, as of the last refresh.
    pub fn row_count(&self) -> usize {
        self.page_end - self.page_start
    }

    /// Live size of the bound table.
    pub fn table_size(&self) -> usize {
        (self.supplier)().map(|t| t.row_count()).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        (self.supplier)().map(|t| t.column_count()).unwrap_or(0)
    }

    /// Value at the page-relative row, or NULL when the table has not
    /// materialized that row yet.
    pub fn get(&self, row: usize, col: usize) -> SqlValue {
        let Some(table) = (self.supplier)() else {
            return Value::Null;
        };
        let idx = self.page_start + row;
        if idx < table.row_count() {
            table.value_at(idx, col).unwrap_or(Value::Null)
        } else {
            Value::Null
        }
    }

    /// Header text for a column: `name [TYPE]`, bare name for the
    /// synthetic row-id column.
    pub fn column_label(&self, col: usize) -> String {
        let Some(table) = (self.supplier)() else {
            return String::new();
        };
        let name = table.column_name(col).unwrap_or_default();
        let type_name = table.column_type(col).map(|t| t.name()).unwrap_or("");
        if type_name.is_empty() {
            name
        } else {
            format!("{} [{}]", name, type_name)
        }
    }

    pub fn column_type(&self, col: usize) -> SqlType {
        (self.supplier)()
            .and_then(|t| t.column_type(col))
            .unwrap_or(SqlType::Varchar)
    }
}
