//! 意图：和类型 + 显式映射表
//!
//! 分类服务只返回意图名和参数；`IntentTable` 在启动时由内置表与配置别名构建，
//! 把意图名映射为 `IntentKind`，再从参数里取出各变体需要的字段。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::collab::ClassificationResult;

/// 意图种类（映射表的值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Greeting,
    Affirm,
    Deny,
    Cancel,
    Help,
    ProvideName,
    DescribeObject,
    SearchModel,
    NextPage,
    SelectOption,
    SetParameter,
    StartSlicing,
    HardwareTutorial,
    WorkflowTutorial,
    StartChecklist,
}

/// 识别出的意图，携带结构化参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    Affirm,
    Deny,
    Cancel,
    Help,
    ProvideName { name: Option<String> },
    DescribeObject { description: Option<String> },
    SearchModel { term: Option<String> },
    NextPage,
    /// 从 1 开始的序号
    SelectOption { index: Option<usize> },
    SetParameter { name: String, value: String },
    StartSlicing,
    HardwareTutorial,
    WorkflowTutorial,
    StartChecklist,
    /// 映射表里没有的意图名
    Unknown { name: String },
}

impl Intent {
    pub fn kind(&self) -> Option<IntentKind> {
        Some(match self {
            Intent::Greeting => IntentKind::Greeting,
            Intent::Affirm => IntentKind::Affirm,
            Intent::Deny => IntentKind::Deny,
            Intent::Cancel => IntentKind::Cancel,
            Intent::Help => IntentKind::Help,
            Intent::ProvideName { .. } => IntentKind::ProvideName,
            Intent::DescribeObject { .. } => IntentKind::DescribeObject,
            Intent::SearchModel { .. } => IntentKind::SearchModel,
            Intent::NextPage => IntentKind::NextPage,
            Intent::SelectOption { .. } => IntentKind::SelectOption,
            Intent::SetParameter { .. } => IntentKind::SetParameter,
            Intent::StartSlicing => IntentKind::StartSlicing,
            Intent::HardwareTutorial => IntentKind::HardwareTutorial,
            Intent::WorkflowTutorial => IntentKind::WorkflowTutorial,
            Intent::StartChecklist => IntentKind::StartChecklist,
            Intent::Unknown { .. } => return None,
        })
    }
}

const BUILTIN: &[(&str, IntentKind)] = &[
    ("greeting", IntentKind::Greeting),
    ("hello", IntentKind::Greeting),
    ("affirm", IntentKind::Affirm),
    ("yes", IntentKind::Affirm),
    ("deny", IntentKind::Deny),
    ("no", IntentKind::Deny),
    ("cancel", IntentKind::Cancel),
    ("help", IntentKind::Help),
    ("provide_name", IntentKind::ProvideName),
    ("describe_object", IntentKind::DescribeObject),
    ("search_model", IntentKind::SearchModel),
    ("next_page", IntentKind::NextPage),
    ("select_option", IntentKind::SelectOption),
    ("set_parameter", IntentKind::SetParameter),
    ("start_slicing", IntentKind::StartSlicing),
    ("hardware_tutorial", IntentKind::HardwareTutorial),
    ("workflow_tutorial", IntentKind::WorkflowTutorial),
    ("start_checklist", IntentKind::StartChecklist),
];

/// 意图名 → 意图种类
#[derive(Debug, Clone)]
pub struct IntentTable {
    names: HashMap<String, IntentKind>,
}

impl Default for IntentTable {
    fn default() -> Self {
        Self {
            names: BUILTIN
                .iter()
                .map(|(name, kind)| (name.to_string(), *kind))
                .collect(),
        }
    }
}

impl IntentTable {
    /// 在内置表上叠加别名（同名覆盖）
    pub fn with_aliases(mut self, aliases: &HashMap<String, IntentKind>) -> Self {
        for (name, kind) in aliases {
            self.names.insert(name.to_lowercase(), *kind);
        }
        self
    }

    pub fn lookup(&self, name: &str) -> Option<IntentKind> {
        self.names.get(&name.to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// 分类结果 → Intent
    pub fn resolve(&self, result: &ClassificationResult) -> Intent {
        let kind = match self.lookup(&result.intent) {
            Some(kind) => kind,
            None => {
                return Intent::Unknown {
                    name: result.intent.clone(),
                }
            }
        };
        let params = &result.parameters;

        match kind {
            IntentKind::Greeting => Intent::Greeting,
            IntentKind::Affirm => Intent::Affirm,
            IntentKind::Deny => Intent::Deny,
            IntentKind::Cancel => Intent::Cancel,
            IntentKind::Help => Intent::Help,
            IntentKind::ProvideName => Intent::ProvideName {
                name: string_param(params, "name"),
            },
            IntentKind::DescribeObject => Intent::DescribeObject {
                description: string_param(params, "description"),
            },
            IntentKind::SearchModel => Intent::SearchModel {
                term: string_param(params, "term"),
            },
            IntentKind::NextPage => Intent::NextPage,
            IntentKind::SelectOption => Intent::SelectOption {
                index: string_param(params, "index").and_then(|s| s.parse().ok()),
            },
            IntentKind::SetParameter => Intent::SetParameter {
                name: string_param(params, "parameter").unwrap_or_default(),
                value: string_param(params, "value").unwrap_or_default(),
            },
            IntentKind::StartSlicing => Intent::StartSlicing,
            IntentKind::HardwareTutorial => Intent::HardwareTutorial,
            IntentKind::WorkflowTutorial => Intent::WorkflowTutorial,
            IntentKind::StartChecklist => Intent::StartChecklist,
        }
    }
}

/// 取字符串参数；数字、布尔值转成字符串，空串视为缺失
fn string_param(params: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    let value = match params.get(key)? {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_builtin_names() {
        let table = IntentTable::default();
        assert_eq!(
            table.resolve(&ClassificationResult::new("affirm")),
            Intent::Affirm
        );
        assert_eq!(table.resolve(&ClassificationResult::new("YES")), Intent::Affirm);
        assert_eq!(
            table.resolve(&ClassificationResult::new("search_model").with_param("term", "benchy")),
            Intent::SearchModel {
                term: Some("benchy".to_string())
            }
        );
    }

    #[test]
    fn test_resolve_numeric_index() {
        let table = IntentTable::default();
        let intent = table.resolve(&ClassificationResult::new("select_option").with_param("index", 2));
        assert_eq!(intent, Intent::SelectOption { index: Some(2) });

        let intent = table.resolve(&ClassificationResult::new("select_option").with_param("index", "two"));
        assert_eq!(intent, Intent::SelectOption { index: None });
    }

    #[test]
    fn test_unknown_and_aliases() {
        let table = IntentTable::default();
        let unknown = table.resolve(&ClassificationResult::new("smalltalk.weather"));
        assert_eq!(
            unknown,
            Intent::Unknown {
                name: "smalltalk.weather".to_string()
            }
        );
        assert!(unknown.kind().is_none());

        let mut aliases = HashMap::new();
        aliases.insert("smalltalk.weather".to_string(), IntentKind::Help);
        let table = table.with_aliases(&aliases);
        assert_eq!(
            table.resolve(&ClassificationResult::new("smalltalk.weather")),
            Intent::Help
        );
    }

    #[test]
    fn test_empty_string_param_is_missing() {
        let table = IntentTable::default();
        let intent = table.resolve(&ClassificationResult::new("provide_name").with_param("name", "  "));
        assert_eq!(intent, Intent::ProvideName { name: None });
    }
}
