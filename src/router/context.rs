//! 会话上下文范围
//!
//! 分类服务每次返回的上下文如何并入会话，由当前对话选择的 `ContextPolicy` 决定：
//! - `SingleReplace`：只跟踪一个上下文，用返回的第一个值替换；返回为空时不变
//! - `MultiToggle`：多上下文集合，返回的每个值切换其存在性

use std::collections::BTreeSet;

use serde::Serialize;

/// 上下文合并策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContextPolicy {
    SingleReplace,
    MultiToggle,
}

/// 会话上下文集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextScope {
    tags: BTreeSet<String>,
    /// 下一次分类调用要求服务端清空上下文
    reset_pending: bool,
}

impl ContextScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// 并入分类服务返回的上下文，返回集合是否变化
    pub fn apply(&mut self, policy: ContextPolicy, returned: &[String]) -> bool {
        match policy {
            ContextPolicy::SingleReplace => {
                let Some(first) = returned.first() else {
                    return false;
                };
                if self.tags.len() == 1 && self.tags.contains(first) {
                    return false;
                }
                self.tags.clear();
                self.tags.insert(first.clone());
                true
            }
            ContextPolicy::MultiToggle => {
                let unique: BTreeSet<&String> = returned.iter().collect();
                for tag in &unique {
                    if !self.tags.remove(*tag) {
                        self.tags.insert((*tag).clone());
                    }
                }
                !unique.is_empty()
            }
        }
    }

    /// 清空并标记下一次分类需要重置
    pub fn reset(&mut self) {
        self.tags.clear();
        self.reset_pending = true;
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }

    pub fn clear_reset(&mut self) {
        self.reset_pending = false;
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.tags.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ContextScope {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().map(Into::into).collect(),
            reset_pending: false,
        }
    }
}
