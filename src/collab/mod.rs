//! 外部协作者接口
//!
//! 核心只依赖这里的 trait：分类服务、消息通道、附件存储、切片任务服务、模型搜索、静态文案。
//! 所有句柄经 `Collaborators` 在构造时显式注入编排器和子对话，没有全局单例。

mod content;
mod local;
pub mod mock;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

pub use content::StaticContentStore;
pub use local::{CatalogSearchService, DirectoryAttachmentStore};

/// 协作者调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollabError {
    #[error("Classification unavailable: {0}")]
    ClassificationUnavailable(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Attachment size {size} exceeds {limit}")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("IO failure: {0}")]
    Io(String),

    #[error("Job submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Search query failed: {0}")]
    QueryFailed(String),

    #[error("No content for {dialog}/{state}")]
    ContentMissing { dialog: String, state: String },
}

/// 分类服务返回结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// 意图名（由 IntentTable 映射为 Intent）
    pub intent: String,
    /// 结构化参数
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// 服务返回的上下文
    #[serde(default)]
    pub contexts: Vec<String>,
}

impl ClassificationResult {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_contexts(mut self, contexts: &[&str]) -> Self {
        self.contexts = contexts.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// 已发送消息的 ID（用于原地编辑）
pub type MessageId = u64;

/// 内联键盘按钮：显示文本 + 回调数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardButton {
    pub label: String,
    pub data: String,
}

impl KeyboardButton {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// 内联键盘（按行排列）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    pub rows: Vec<Vec<KeyboardButton>>,
}

impl Keyboard {
    pub fn row(mut self, buttons: Vec<KeyboardButton>) -> Self {
        self.rows.push(buttons);
        self
    }

    pub fn yes_no() -> Self {
        Keyboard::default().row(vec![
            KeyboardButton::new("Yes", "yes"),
            KeyboardButton::new("No", "no"),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| r.is_empty())
    }
}

/// 一条静态文案：文本 + 媒体 + 键盘
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageContent {
    pub text: String,
    pub media: Vec<String>,
    pub keyboard: Option<Keyboard>,
}

impl MessageContent {
    /// 替换 `{key}` 占位符
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut text = self.text.clone();
        for (key, value) in vars {
            text = text.replace(&format!("{{{}}}", key), value);
        }
        text
    }
}

/// 入站附件描述（尚未落盘）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub name: String,
    pub size_bytes: u64,
    /// 通道侧引用（文件 ID 或本地源路径）
    pub file_ref: String,
}

/// 模型搜索命中
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHit {
    pub name: String,
    pub link: String,
}

/// 一页搜索结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub items: Vec<ModelHit>,
    /// 全部命中数
    pub total: usize,
}

/// 切片参数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceParameters {
    pub model_path: String,
    pub layer_height_mm: f32,
    pub infill_percent: u8,
    pub supports: bool,
}

/// 切片任务的终态结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobCompletion {
    pub artifact_link: String,
    pub duration_secs: u64,
    /// 预估耗材（克）
    pub filament_grams: f64,
}

/// 任务订阅：只会收到一次终态
pub struct JobSubscription {
    pub job_id: String,
    pub completion: oneshot::Receiver<Result<JobCompletion, CollabError>>,
}

/// 意图分类服务
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        session_id: &str,
        text: &str,
        contexts: &[String],
        reset_contexts: bool,
    ) -> Result<ClassificationResult, CollabError>;
}

/// 消息通道
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(
        &self,
        session_id: &str,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageId, CollabError>;

    async fn edit_text(
        &self,
        session_id: &str,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), CollabError>;

    async fn send_media(
        &self,
        session_id: &str,
        media: &[String],
        caption: Option<&str>,
    ) -> Result<(), CollabError>;
}

/// 附件落盘
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn persist(&self, session_id: &str, attachment: &AttachmentRef)
        -> Result<PathBuf, CollabError>;
}

/// 切片任务服务
#[async_trait]
pub trait JobService: Send + Sync {
    async fn submit(&self, params: &SliceParameters) -> Result<JobSubscription, CollabError>;
}

/// 模型搜索服务
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn query(&self, term: &str, page: usize, page_size: usize)
        -> Result<ResultSet, CollabError>;
}

/// 静态文案（外部编写）
pub trait ContentStore: Send + Sync {
    fn get_message(&self, dialog_id: &str, state_id: &str) -> Result<MessageContent, CollabError>;
}

/// 协作者句柄集合，构造时注入
#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn Classifier>,
    pub transport: Arc<dyn Transport>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub jobs: Arc<dyn JobService>,
    pub search: Arc<dyn SearchService>,
    pub content: Arc<dyn ContentStore>,
}
