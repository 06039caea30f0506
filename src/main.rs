//! PrintGuide 控制台宿主
//!
//! 在 stdin/stdout 上运行一个会话，协作者全部使用本地 / mock 实现：
//! 普通输入作为文本消息，`/file <path>` 上传附件，`/tap <data>` 点按钮，`/quit` 退出。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use printguide::collab::mock::{KeywordClassifier, SimulatedJobService, StdoutTransport};
use printguide::collab::{
    AttachmentRef, CatalogSearchService, Collaborators, DirectoryAttachmentStore,
    StaticContentStore,
};
use printguide::config::{load_config, AppConfig};
use printguide::core::OrchestratorDeps;
use printguide::gateway::SessionRegistry;
use printguide::observability;
use printguide::router::{IntentTable, RawEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

const CONSOLE_SESSION: &str = "console";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let (config, config_error) = match load_config(config_path) {
        Ok(c) => (c, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    observability::init(&config.app.log_level);
    if let Some(e) = config_error {
        tracing::warn!("Failed to load config, using defaults: {}", e);
    }

    let mut content = StaticContentStore::with_defaults().context("Built-in content is invalid")?;
    if let Some(ref path) = config.storage.content_file {
        content
            .merge_file(path)
            .with_context(|| format!("Failed to load content file {}", path.display()))?;
    }

    let collab = Collaborators {
        classifier: Arc::new(KeywordClassifier::new()),
        transport: Arc::new(StdoutTransport::default()),
        attachments: Arc::new(DirectoryAttachmentStore::new(
            &config.storage.attachment_dir,
            config.dialog.max_attachment_bytes,
        )),
        jobs: Arc::new(SimulatedJobService::new(Duration::from_secs(3))),
        search: Arc::new(CatalogSearchService::with_demo_catalog()),
        content: Arc::new(content),
    };

    let intents = IntentTable::default().with_aliases(&config.intents.aliases);
    let sweep = Duration::from_secs(config.dialog.sweep_interval_secs.max(1));
    let idle_timeout = Duration::from_secs(config.dialog.session_idle_timeout_secs);
    let deps = OrchestratorDeps::new(collab, config.dialog.clone(), intents);

    let registry = SessionRegistry::new(deps);
    let sweeper = registry.spawn_sweeper(sweep, idle_timeout);
    tracing::info!(
        app = config.app.name.as_deref().unwrap_or("printguide"),
        "console session ready"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        let event = if let Some(data) = line.strip_prefix("/tap ") {
            RawEvent::Callback(data.trim().to_string())
        } else if let Some(path) = line.strip_prefix("/file ") {
            match attachment_from_path(path.trim()).await {
                Ok(a) => RawEvent::Attachment(a),
                Err(e) => {
                    eprintln!("{:#}", e);
                    continue;
                }
            }
        } else {
            RawEvent::Text(line.to_string())
        };

        if let Err(e) = registry.dispatch(CONSOLE_SESSION, event) {
            tracing::error!("dispatch failed: {}", e);
            break;
        }
    }

    // 管道输入可能还在队列里
    if tokio::time::timeout(DRAIN_TIMEOUT, registry.drain(CONSOLE_SESSION))
        .await
        .is_err()
    {
        tracing::warn!("pending input not processed within {:?}", DRAIN_TIMEOUT);
    }
    registry.shutdown();
    let _ = sweeper.await;
    Ok(())
}

async fn attachment_from_path(path: &str) -> anyhow::Result<AttachmentRef> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Cannot read {}", path))?;
    let name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());
    Ok(AttachmentRef {
        name,
        size_bytes: meta.len(),
        file_ref: path.to_string(),
    })
}
