//! 静态文案：从 TOML 加载
//!
//! 结构为 `[<dialog_id>.<state_id>]`，字段 text / media / keyboard（按行的按钮数组）。

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::{CollabError, ContentStore, Keyboard, KeyboardButton, MessageContent};

const DEFAULT_CONTENT: &str = include_str!("../../config/content.toml");

#[derive(Debug, Clone, Deserialize)]
struct ContentEntry {
    text: String,
    #[serde(default)]
    media: Vec<String>,
    #[serde(default)]
    keyboard: Vec<Vec<KeyboardButton>>,
}

/// 内存中的静态文案表
#[derive(Debug, Clone, Default)]
pub struct StaticContentStore {
    dialogs: HashMap<String, HashMap<String, ContentEntry>>,
}

impl StaticContentStore {
    /// 内置默认文案（config/content.toml）
    pub fn with_defaults() -> Result<Self, toml::de::Error> {
        Self::from_toml_str(DEFAULT_CONTENT)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        let dialogs: HashMap<String, HashMap<String, ContentEntry>> = toml::from_str(s)?;
        Ok(Self { dialogs })
    }

    /// 从文件加载，覆盖同名条目
    pub fn merge_file(&mut self, path: &Path) -> Result<(), CollabError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CollabError::Io(e.to_string()))?;
        let other = Self::from_toml_str(&raw).map_err(|e| CollabError::Io(e.to_string()))?;
        for (dialog, states) in other.dialogs {
            self.dialogs.entry(dialog).or_default().extend(states);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.dialogs.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for StaticContentStore {
    fn get_message(&self, dialog_id: &str, state_id: &str) -> Result<MessageContent, CollabError> {
        let entry = self
            .dialogs
            .get(dialog_id)
            .and_then(|states| states.get(state_id))
            .ok_or_else(|| CollabError::ContentMissing {
                dialog: dialog_id.to_string(),
                state: state_id.to_string(),
            })?;

        let keyboard = if entry.keyboard.is_empty() {
            None
        } else {
            Some(Keyboard {
                rows: entry.keyboard.clone(),
            })
        };

        Ok(MessageContent {
            text: entry.text.clone(),
            media: entry.media.clone(),
            keyboard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_dialog() {
        let store = StaticContentStore::with_defaults().unwrap();
        for (dialog, state) in [
            ("orchestrator", "starting"),
            ("orchestrator", "entering_name"),
            ("orchestrator", "idle"),
            ("orchestrator", "model_received"),
            ("object_collection", "describing"),
            ("model_search", "results"),
            ("slicing", "in_progress"),
            ("checklist", "blocked"),
            ("hardware_tutorial", "finished"),
            ("workflow_tutorial", "finished"),
        ] {
            assert!(
                store.get_message(dialog, state).is_ok(),
                "missing {}/{}",
                dialog,
                state
            );
        }
    }

    #[test]
    fn test_keyboard_and_media_parsed() {
        let store = StaticContentStore::from_toml_str(
            r#"
            [demo.ask]
            text = "Pick one"
            media = ["a.jpg"]
            keyboard = [[{ label = "Yes", data = "yes" }, { label = "No", data = "no" }]]
            "#,
        )
        .unwrap();

        let msg = store.get_message("demo", "ask").unwrap();
        assert_eq!(msg.media, vec!["a.jpg"]);
        assert_eq!(msg.keyboard.unwrap().rows[0].len(), 2);
    }

    #[test]
    fn test_missing_content() {
        let store = StaticContentStore::default();
        let err = store.get_message("nope", "nothing").unwrap_err();
        assert!(matches!(err, CollabError::ContentMissing { .. }));
    }
}
