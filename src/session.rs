use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::SessionError;
use crate::models::{DocumentEntry, DocumentStore, LedgerRecord};

/// 会话快照 (保存/加载契约)
///
/// 只含台账记录与文档元数据; 文档二进制由外部 blob 存储按 id 另存,
/// 恢复后的 DocumentEntry.content 为空占位, 需按 id 二次加载。
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub saved_at: DateTime<Utc>,
    pub ledger_records: Vec<LedgerRecord>,
    pub documents: Vec<DocumentEntry>,
}

impl SessionSnapshot {
    /// 抓取当前会话的点时刻快照
    pub fn capture(ledger_records: &[LedgerRecord], store: &DocumentStore) -> Self {
        Self {
            saved_at: Utc::now(),
            ledger_records: ledger_records.to_vec(),
            documents: store.snapshot(),
        }
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(json)?)
    }

    /// 把快照里的文档放回文档库 (content 为空, 等待 blob 存储补齐)
    pub fn restore_documents(&self, store: &Arc<DocumentStore>) {
        for doc in &self.documents {
            store.restore(doc.clone());
        }
    }
}
