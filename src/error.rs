use thiserror::Error;

/// 台账导入错误
///
/// 文件整体无法解析是致命错误; 能解析但没有提取到任何记录是独立的
/// "空结果" 状态, 两者不可混淆 (调用方提示语不同)。
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("无法解析台账文件: {0}")]
    Unreadable(String),

    #[error("台账文件中未提取到任何记录")]
    NoRecords,
}

/// 识别调用错误
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// 限流 (429), 重试耗尽后返回
    #[error("识别服务限流, 已重试 {attempts} 次仍失败")]
    RateLimited { attempts: u32 },

    /// 服务端错误 (5xx), 重试耗尽后返回
    #[error("识别服务端错误 ({status}): {message}")]
    Server { status: u16, message: String },

    /// 请求本身无效 (4xx, 不重试)
    #[error("识别请求无效 ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    /// 响应不是预期的 JSON 数组
    #[error("识别响应无法解析: {0}")]
    InvalidResponse(String),

    /// 网络层失败 (不重试, 直接上抛)
    #[error("识别请求网络失败: {0}")]
    Network(String),
}

impl ExtractionError {
    /// 是否属于可重试的瞬时错误 (限流或服务端错误)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractionError::RateLimited { .. } | ExtractionError::Server { .. }
        )
    }

    /// 是否为限流错误 (用户提示 "额度用尽" 而非原始错误文本)
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ExtractionError::RateLimited { .. })
    }
}

/// 会话快照错误 (保存/恢复契约层)
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("会话快照序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),
}
