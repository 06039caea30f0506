//! 本地实现：目录附件存储、内存模型目录搜索

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{AttachmentStore, CollabError, ModelHit, ResultSet, SearchService};

/// 把附件复制到 `<root>/<session_id>/<name>`
///
/// `file_ref` 必须是可读的本地源路径；真实通道的下载不在这里处理。
#[derive(Debug, Clone)]
pub struct DirectoryAttachmentStore {
    root: PathBuf,
    max_bytes: u64,
}

impl DirectoryAttachmentStore {
    pub fn new(root: impl AsRef<Path>, max_bytes: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_bytes,
        }
    }
}

/// 只保留文件名部分，防止 `../` 逃逸
fn sanitize_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if base.is_empty() {
        "attachment.bin".to_string()
    } else {
        base
    }
}

#[async_trait]
impl AttachmentStore for DirectoryAttachmentStore {
    async fn persist(
        &self,
        session_id: &str,
        attachment: &super::AttachmentRef,
    ) -> Result<PathBuf, CollabError> {
        if attachment.size_bytes > self.max_bytes {
            return Err(CollabError::SizeExceeded {
                size: attachment.size_bytes,
                limit: self.max_bytes,
            });
        }

        let dir = self.root.join(sanitize_name(session_id));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CollabError::Io(e.to_string()))?;

        let target = dir.join(sanitize_name(&attachment.name));
        tokio::fs::copy(&attachment.file_ref, &target)
            .await
            .map_err(|e| CollabError::Io(format!("{}: {}", attachment.file_ref, e)))?;

        Ok(target)
    }
}

/// 内存模型目录：按名称子串（不区分大小写）匹配
#[derive(Debug, Clone, Default)]
pub struct CatalogSearchService {
    models: Vec<ModelHit>,
}

impl CatalogSearchService {
    pub fn new(models: Vec<ModelHit>) -> Self {
        Self { models }
    }

    /// 演示目录
    pub fn with_demo_catalog() -> Self {
        let entries = [
            ("3DBenchy", "https://models.example.org/3dbenchy.stl"),
            ("Calibration Cube", "https://models.example.org/calibration-cube.stl"),
            ("Phone Stand", "https://models.example.org/phone-stand.stl"),
            ("Cable Clip", "https://models.example.org/cable-clip.stl"),
            ("Plant Pot", "https://models.example.org/plant-pot.stl"),
            ("Spool Holder", "https://models.example.org/spool-holder.stl"),
            ("Desk Organizer", "https://models.example.org/desk-organizer.stl"),
            ("Phone Case", "https://models.example.org/phone-case.stl"),
        ];
        Self::new(
            entries
                .iter()
                .map(|(name, link)| ModelHit {
                    name: name.to_string(),
                    link: link.to_string(),
                })
                .collect(),
        )
    }
}

#[async_trait]
impl SearchService for CatalogSearchService {
    async fn query(&self, term: &str, page: usize, page_size: usize) -> Result<ResultSet, CollabError> {
        if page_size == 0 {
            return Err(CollabError::QueryFailed("page size must be positive".to_string()));
        }
        let needle = term.trim().to_lowercase();
        let matches: Vec<&ModelHit> = self
            .models
            .iter()
            .filter(|m| needle.split_whitespace().any(|w| m.name.to_lowercase().contains(w)))
            .collect();

        let items = matches
            .iter()
            .skip(page * page_size)
            .take(page_size)
            .map(|m| (*m).clone())
            .collect();

        Ok(ResultSet {
            items,
            total: matches.len(),
        })
    }
}
