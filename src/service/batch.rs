use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::models::{
    invoice_matching_key, DocumentStatus, DocumentStore, ExtractedInvoice, ModelTier, Usage,
};
use crate::service::extraction::ExtractionClient;

/// 批处理选项
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// 并发上限 (全局在途调用数, 不是固定分波)
    pub concurrency: usize,
    /// 进度缓冲刷新间隔
    pub flush_interval_ms: u64,
    pub tier: ModelTier,
    /// 识别前图像增强 (失败不致命)
    pub enhance_images: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 20,
            flush_interval_ms: 500,
            tier: ModelTier::Hybrid,
            enhance_images: true,
        }
    }
}

/// 一条文档状态变化 (进度快照的最小单元)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChange {
    pub document_id: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
}

/// 定期刷出的进度快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub changes: Vec<DocumentChange>,
}

/// 批处理汇总: 单个文档失败不算批失败, 失败只是 ERROR 占比
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub usage: Usage,
    pub models_used: BTreeSet<String>,
}

/// 批处理协调器: N 个 worker 从共享队列取件直到取空
///
/// 会话级状态 (已见发票号集合) 挂在协调器上, 跨多次 run 存续。
pub struct BatchCoordinator {
    store: Arc<DocumentStore>,
    client: Arc<ExtractionClient>,
    /// 会话级已见发票号 (标准化后), 并发插入幂等
    seen_numbers: Arc<DashSet<String>>,
}

/// worker 间共享的运行状态
struct RunState {
    queue: Mutex<VecDeque<String>>,
    changes: Mutex<Vec<DocumentChange>>,
    completed: AtomicUsize,
    total: usize,
    succeeded: AtomicUsize,
    usage: Mutex<Usage>,
    models_used: Mutex<BTreeSet<String>>,
}

impl BatchCoordinator {
    pub fn new(store: Arc<DocumentStore>, client: Arc<ExtractionClient>) -> Self {
        Self {
            store,
            client,
            seen_numbers: Arc::new(DashSet::new()),
        }
    }

    /// 驱动所有待处理文档直到全部落定 (SUCCESS 或 ERROR)
    ///
    /// 进度经 `progress_tx` 以快照形式发布: 变化先进缓冲, 定时原子换出
    /// 再下发, 排空后做最后一次冲刷, 保证最后一个 tick 错过也不丢变化。
    pub async fn run(
        &self,
        pending_ids: Vec<String>,
        options: BatchOptions,
        session_sellers: Arc<std::collections::HashMap<String, String>>,
        progress_tx: Option<mpsc::UnboundedSender<BatchProgress>>,
    ) -> BatchSummary {
        let started = Instant::now();
        let total = pending_ids.len();
        tracing::info!("批处理开始: {} 个文档, 并发 {}", total, options.concurrency);

        let state = Arc::new(RunState {
            queue: Mutex::new(pending_ids.into_iter().collect()),
            changes: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
            total,
            succeeded: AtomicUsize::new(0),
            usage: Mutex::new(Usage::default()),
            models_used: Mutex::new(BTreeSet::new()),
        });

        // 定时冲刷进度缓冲
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let flush_state = state.clone();
        let flush_tx = progress_tx.clone();
        let flush_interval = Duration::from_millis(options.flush_interval_ms.max(1));
        let flusher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => flush_changes(&flush_state, flush_tx.as_ref(), false),
                    _ = stop_rx.changed() => break,
                }
            }
        });

        // worker 池: 谁先空闲谁取下一件
        let worker_count = options.concurrency.max(1).min(total.max(1));
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let state = state.clone();
            let store = self.store.clone();
            let client = self.client.clone();
            let seen = self.seen_numbers.clone();
            let sellers = session_sellers.clone();
            let options = options.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = state.queue.lock().unwrap().pop_front();
                    let Some(doc_id) = next else { break };
                    process_one(&doc_id, &state, &store, &client, &seen, &sellers, &options).await;
                    state.completed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }

        // 停掉定时器后做最终冲刷
        let _ = stop_tx.send(true);
        let _ = flusher.await;
        flush_changes(&state, progress_tx.as_ref(), true);

        let succeeded = state.succeeded.load(Ordering::SeqCst);
        let summary = BatchSummary {
            total,
            succeeded,
            failed: total - succeeded,
            duration_ms: started.elapsed().as_millis() as u64,
            usage: *state.usage.lock().unwrap(),
            models_used: state.models_used.lock().unwrap().clone(),
        };
        tracing::info!(
            "批处理完成: {}/{} 成功, 耗时 {}ms",
            summary.succeeded,
            summary.total,
            summary.duration_ms
        );
        summary
    }
}

/// 冲刷缓冲: 先整体换出快照再下发, 避免 "清了缓冲却没用上内容" 的竞态
fn flush_changes(
    state: &RunState,
    tx: Option<&mpsc::UnboundedSender<BatchProgress>>,
    force: bool,
) {
    let snapshot = {
        let mut buf = state.changes.lock().unwrap();
        std::mem::take(&mut *buf)
    };
    if snapshot.is_empty() && !force {
        return;
    }
    if let Some(tx) = tx {
        let _ = tx.send(BatchProgress {
            completed: state.completed.load(Ordering::SeqCst),
            total: state.total,
            changes: snapshot,
        });
    }
}

fn record_change(state: &RunState, doc_id: &str, status: DocumentStatus, error: Option<String>) {
    state.changes.lock().unwrap().push(DocumentChange {
        document_id: doc_id.to_string(),
        status,
        error_message: error,
    });
}

/// 处理单个文档; 任何失败都收敛为该文档的 ERROR, 不外逸
async fn process_one(
    doc_id: &str,
    state: &RunState,
    store: &DocumentStore,
    client: &ExtractionClient,
    seen: &DashSet<String>,
    sellers: &std::collections::HashMap<String, String>,
    options: &BatchOptions,
) {
    store.mark_processing(doc_id);
    record_change(state, doc_id, DocumentStatus::Processing, None);

    let Some((content, mime_type)) = store.content_of(doc_id) else {
        let msg = "檔案內容不存在".to_string();
        store.mark_error(doc_id, msg.clone());
        record_change(state, doc_id, DocumentStatus::Error, Some(msg));
        return;
    };

    // 图像增强失败退回原图, 只记 warning
    let content = if options.enhance_images && mime_type.starts_with("image/") {
        match enhance_image(&content) {
            Ok(enhanced) => enhanced,
            Err(e) => {
                tracing::warn!("文档 {} 图像增强失败, 使用原图: {}", doc_id, e);
                content
            }
        }
    } else {
        content
    };

    match client.extract(&content, &mime_type, options.tier, sellers).await {
        Ok(outcome) if outcome.invoices.is_empty() => {
            let msg = "未能辨識出任何發票".to_string();
            store.mark_error(doc_id, msg.clone());
            record_change(state, doc_id, DocumentStatus::Error, Some(msg));
        }
        Ok(outcome) => {
            {
                let mut usage = state.usage.lock().unwrap();
                usage.prompt_tokens += outcome.usage.prompt_tokens;
                usage.output_tokens += outcome.usage.output_tokens;
            }
            state
                .models_used
                .lock()
                .unwrap()
                .insert(outcome.model_used.clone());

            let invoices = warn_duplicates(doc_id, outcome.invoices, seen);
            store.mark_success(doc_id, invoices);
            state.succeeded.fetch_add(1, Ordering::SeqCst);
            record_change(state, doc_id, DocumentStatus::Success, None);
        }
        Err(err) => {
            let msg = if err.is_rate_limited() {
                "API 額度已用盡, 請稍後再試".to_string()
            } else {
                err.to_string()
            };
            tracing::warn!("文档 {} 识别失败: {}", doc_id, msg);
            store.mark_error(doc_id, msg.clone());
            record_change(state, doc_id, DocumentStatus::Error, Some(msg));
        }
    }
}

/// 会话级重复发票号检测: 重复只追加警告 trace, 不拒收
fn warn_duplicates(
    doc_id: &str,
    mut invoices: Vec<ExtractedInvoice>,
    seen: &DashSet<String>,
) -> Vec<ExtractedInvoice> {
    for inv in &mut invoices {
        let Some(number) = inv.invoice_number.as_deref() else {
            continue;
        };
        let key = invoice_matching_key(number);
        if key.is_empty() {
            continue;
        }
        if !seen.insert(key) {
            tracing::warn!("文档 {} 发票号重复: {}", doc_id, number);
            inv.trace_logs
                .push(format!("[警告] 發票號 {} 已在本次稽核其他檔案出現過", number));
        }
    }
    invoices
}

/// 对比度 + 锐化预处理
fn enhance_image(content: &[u8]) -> Result<Vec<u8>, String> {
    let img = image::load_from_memory(content).map_err(|e| e.to_string())?;
    let enhanced = img.adjust_contrast(12.0).unsharpen(1.2, 3);
    let mut out = std::io::Cursor::new(Vec::new());
    enhanced
        .write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| e.to_string())?;
    Ok(out.into_inner())
}
