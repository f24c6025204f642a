use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::extraction::ExtractedInvoice;

/// 文档处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Success,
    Error,
}

/// 一个上传的票据文件 (图片/PDF)
///
/// 二进制内容不进会话快照, 由外部 blob 存储按 id 单独保存;
/// 恢复快照后 content 为空占位, 待按 id 二次加载。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEntry {
    /// 文件名去扩展名得到; 两个不同文件撞名时追加扩展名消歧
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    /// 渲染句柄, 每次上传刷新 (预览缓存失效用)
    pub render_key: String,
    pub status: DocumentStatus,
    /// 一个文件可能含多张实体发票 (多页扫描), 保持识别返回顺序
    #[serde(default)]
    pub extracted_invoices: Vec<ExtractedInvoice>,
    pub error_message: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// 会话内文档库 (并发安全, 批处理 worker 直接写)
#[derive(Debug, Default)]
pub struct DocumentStore {
    entries: DashMap<String, DocumentEntry>,
    /// 渲染句柄单调计数, 保证同毫秒重传也会刷新
    render_generation: std::sync::atomic::AtomicU64,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 上传 (或重传) 一个文件, 返回最终 id。
    ///
    /// 同 id 重传: 之前 SUCCESS 只刷新内容与渲染句柄 (识别结果保留);
    /// 之前失败或从未成功则重置为 PENDING 重新排队 —— 重试由上传驱动。
    pub fn upload(&self, file_name: &str, mime_type: &str, content: Vec<u8>) -> String {
        let stem = file_name
            .rsplit_once('.')
            .map(|(s, _)| s)
            .unwrap_or(file_name)
            .to_string();

        // 先按去扩展名的 id 找; 被别的文件占用时退回完整文件名,
        // 连文件名也被占用 (无扩展名可加) 则追加数字后缀直到空出
        let mut id = stem;
        if self.occupied_by_other(&id, file_name) {
            id = file_name.to_string();
            let mut n = 1;
            while self.occupied_by_other(&id, file_name) {
                id = format!("{}-{}", file_name, n);
                n += 1;
            }
        }

        let now = Utc::now();
        let generation = self
            .render_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let render_key = format!("{}@{}", id, generation);

        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.content = content;
            entry.mime_type = mime_type.to_string();
            entry.render_key = render_key;
            entry.uploaded_at = now;
            if entry.status != DocumentStatus::Success {
                entry.status = DocumentStatus::Pending;
                entry.extracted_invoices.clear();
                entry.error_message = None;
            }
            return id;
        }

        self.entries.insert(
            id.clone(),
            DocumentEntry {
                id: id.clone(),
                file_name: file_name.to_string(),
                mime_type: mime_type.to_string(),
                content,
                render_key,
                status: DocumentStatus::Pending,
                extracted_invoices: Vec::new(),
                error_message: None,
                uploaded_at: now,
            },
        );
        id
    }

    /// id 是否已被另一个文件占用
    fn occupied_by_other(&self, id: &str, file_name: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.file_name != file_name)
    }

    /// 从快照恢复的条目直接放入 (content 为空占位)
    pub fn restore(&self, entry: DocumentEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<DocumentEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    /// 待处理文档 id, 字典序
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.status == DocumentStatus::Pending)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// 点时刻元数据快照 (不含二进制内容), 稽核与持久化共用
    pub fn snapshot(&self) -> Vec<DocumentEntry> {
        let mut docs: Vec<DocumentEntry> = self
            .entries
            .iter()
            .map(|e| {
                let mut d = e.clone();
                d.content = Vec::new();
                d
            })
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    /// 取出处理所需的字节与 MIME (克隆, 不锁住条目)
    pub fn content_of(&self, id: &str) -> Option<(Vec<u8>, String)> {
        self.entries
            .get(id)
            .map(|e| (e.content.clone(), e.mime_type.clone()))
    }

    pub fn mark_processing(&self, id: &str) {
        if let Some(mut e) = self.entries.get_mut(id) {
            e.status = DocumentStatus::Processing;
        }
    }

    pub fn mark_success(&self, id: &str, invoices: Vec<ExtractedInvoice>) {
        if let Some(mut e) = self.entries.get_mut(id) {
            e.status = DocumentStatus::Success;
            e.extracted_invoices = invoices;
            e.error_message = None;
        }
    }

    pub fn mark_error(&self, id: &str, message: String) {
        if let Some(mut e) = self.entries.get_mut(id) {
            e.status = DocumentStatus::Error;
            e.extracted_invoices.clear();
            e.error_message = Some(message);
        }
    }

    /// 人工改一条识别结果: 整条按下标替换, 不做字段级合并
    pub fn replace_invoice(&self, id: &str, index: usize, invoice: ExtractedInvoice) -> bool {
        match self.entries.get_mut(id) {
            Some(mut e) if index < e.extracted_invoices.len() => {
                e.extracted_invoices[index] = invoice;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
