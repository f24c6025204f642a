pub mod audit;
pub mod document;
pub mod extraction;
pub mod ledger;

pub use audit::{AuditRow, AuditStatus, AuditSummary, DiffReason, DisplayExtraction, MatchedInvoiceRef};
pub use document::{DocumentEntry, DocumentStatus, DocumentStore};
pub use extraction::{
    amounts_consistent, invoice_matching_key, normalize_invoice_number, DocumentType,
    ExtractedInvoice, ExtractionCode, ModelTier, RawExtractedInvoice, Usage, Verification,
};
pub use ledger::LedgerRecord;
