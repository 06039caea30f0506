//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PRINTGUIDE__*` 覆盖
//! （双下划线表示嵌套，如 `PRINTGUIDE__DIALOG__TICK_INTERVAL_MS=250`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::router::IntentKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub dialog: DialogSection,
    pub intents: IntentsSection,
    pub storage: StorageSection,
}

/// [app] 段：应用名、日志级别
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 默认日志级别，RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// [dialog] 段：附件上限、进度刷新间隔、分页、会话超时、检查项与教程步骤
#[derive(Debug, Clone, Deserialize)]
pub struct DialogSection {
    /// 附件大小上限（字节）
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
    /// 切片进度消息的刷新间隔
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_search_page_size")]
    pub search_page_size: usize,
    /// 无活动多久后移除会话
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 打印前检查项（content.toml 中 checklist 下的 state id）
    #[serde(default = "default_checklist")]
    pub checklist: Vec<String>,
    #[serde(default = "default_hardware_tutorial_steps")]
    pub hardware_tutorial_steps: Vec<String>,
    #[serde(default = "default_workflow_tutorial_steps")]
    pub workflow_tutorial_steps: Vec<String>,
}

impl Default for DialogSection {
    fn default() -> Self {
        Self {
            max_attachment_bytes: default_max_attachment_bytes(),
            tick_interval_ms: default_tick_interval_ms(),
            search_page_size: default_search_page_size(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            checklist: default_checklist(),
            hardware_tutorial_steps: default_hardware_tutorial_steps(),
            workflow_tutorial_steps: default_workflow_tutorial_steps(),
        }
    }
}

fn default_max_attachment_bytes() -> u64 {
    20_000_000
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_search_page_size() -> usize {
    5
}

fn default_session_idle_timeout_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_checklist() -> Vec<String> {
    vec![
        "bed_clean".into(),
        "filament_loaded".into(),
        "nozzle_clean".into(),
        "first_layer_watch".into(),
    ]
}

fn default_hardware_tutorial_steps() -> Vec<String> {
    vec!["intro".into(), "frame".into(), "extruder".into(), "bed".into()]
}

fn default_workflow_tutorial_steps() -> Vec<String> {
    vec!["model".into(), "slicing".into(), "printing".into()]
}

/// [intents] 段：分类服务意图名 → 意图种类，叠加在内置表上
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntentsSection {
    #[serde(default)]
    pub aliases: HashMap<String, IntentKind>,
}

/// [storage] 段：附件落盘目录、额外文案文件
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_attachment_dir")]
    pub attachment_dir: PathBuf,
    /// 覆盖内置文案的 TOML 文件
    pub content_file: Option<PathBuf>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            attachment_dir: default_attachment_dir(),
            content_file: None,
        }
    }
}

fn default_attachment_dir() -> PathBuf {
    PathBuf::from("./data/attachments")
}

/// 从 config 目录加载配置，环境变量 PRINTGUIDE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PRINTGUIDE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PRINTGUIDE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
