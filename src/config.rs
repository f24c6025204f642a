use serde::{Deserialize, Serialize};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub extraction: ExtractionConfig,
    pub batch: BatchConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 识别服务配置 (外部视觉模型)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub api_base: String,
    pub api_key: String,
    /// 快速档模型 (便宜, 混合档的第一步)
    pub fast_model: String,
    /// 精确档模型 (慢, 混合档校验失败后升级)
    pub accurate_model: String,
    /// 瞬时错误最大尝试次数
    pub max_attempts: u32,
    /// 退避基数 (毫秒), 按次数翻倍
    pub backoff_base_ms: u64,
    /// 随机抖动上限 (毫秒)
    pub backoff_jitter_ms: u64,
}

/// 批处理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// 并发上限 (免费限流档建议 3)
    pub concurrency: usize,
    /// 进度缓冲刷新间隔 (毫秒)
    pub flush_interval_ms: u64,
}

/// 稽核配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// 本公司统编, 用于校验识别出的买方统编 (为空则跳过该校验)
    pub company_tax_id: Option<String>,
    /// 报告摘要里的项目名
    pub project_name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            extraction: ExtractionConfig {
                api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                api_key: String::new(),
                fast_model: "gemini-2.0-flash".to_string(),
                accurate_model: "gemini-2.5-pro".to_string(),
                max_attempts: 3,
                backoff_base_ms: 1000,
                backoff_jitter_ms: 500,
            },
            batch: BatchConfig {
                concurrency: 20,
                flush_interval_ms: 500,
            },
            audit: AuditConfig {
                company_tax_id: None,
                project_name: "invoice-audit".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server: ServerConfig {
                host: std::env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: std::env::var("SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(defaults.server.port),
            },
            extraction: ExtractionConfig {
                api_base: std::env::var("EXTRACTION_API_BASE").unwrap_or(defaults.extraction.api_base),
                api_key: std::env::var("EXTRACTION_API_KEY").unwrap_or_default(),
                fast_model: std::env::var("EXTRACTION_FAST_MODEL").unwrap_or(defaults.extraction.fast_model),
                accurate_model: std::env::var("EXTRACTION_ACCURATE_MODEL")
                    .unwrap_or(defaults.extraction.accurate_model),
                max_attempts: env_parse("EXTRACTION_MAX_ATTEMPTS", defaults.extraction.max_attempts),
                backoff_base_ms: env_parse("EXTRACTION_BACKOFF_BASE_MS", defaults.extraction.backoff_base_ms),
                backoff_jitter_ms: env_parse(
                    "EXTRACTION_BACKOFF_JITTER_MS",
                    defaults.extraction.backoff_jitter_ms,
                ),
            },
            batch: BatchConfig {
                concurrency: env_parse("BATCH_CONCURRENCY", defaults.batch.concurrency),
                flush_interval_ms: env_parse("BATCH_FLUSH_INTERVAL_MS", defaults.batch.flush_interval_ms),
            },
            audit: AuditConfig {
                company_tax_id: std::env::var("AUDIT_COMPANY_TAX_ID").ok().filter(|s| !s.is_empty()),
                project_name: std::env::var("AUDIT_PROJECT_NAME").unwrap_or(defaults.audit.project_name),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
