//! Idempotent batch writes.
//!
//! The writer talks to storage through [`WarehouseBackend`]; the bundled
//! [`InMemoryWarehouse`] supports scripted failures for tests.

mod backend;
mod idempotent;
mod rules;

pub use backend::{row_key, InMemoryWarehouse, Row, WarehouseBackend, WarehouseOp, WriteScope};
pub use idempotent::{
    batch_fingerprint, IdempotentWriter, PostWriteValidation, Remediation, WritePath, WriteReport,
    WriteTarget,
};
pub use rules::{apply_rules, is_empty_value, BlockedRow, NonZeroWhen, RequiredFields, ValidationRule};
