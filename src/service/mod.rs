pub mod batch;
pub mod extraction;
pub mod importer;
pub mod reconcile;
pub mod report;

pub use batch::{BatchCoordinator, BatchOptions, BatchProgress, BatchSummary, DocumentChange};
pub use extraction::{
    ExtractionClient, ExtractionOutcome, ExtractionTransport, GeminiTransport, TransportResponse,
};
pub use importer::{Cell, LedgerImporter};
pub use reconcile::ReconciliationEngine;
pub use report::ReportExporter;
