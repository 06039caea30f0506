//! 事件路由：原始事件 → 类型化事件
//!
//! - 附件：先检查大小上限，超限直接标记 `rejected`，不调用分类服务
//! - 文本：带着会话当前上下文调用分类服务，按当前对话的策略更新上下文
//! - 按钮回调、定时器、任务回调：原样转换，不调用分类服务

pub mod context;
pub mod event;
pub mod intent;

use std::sync::Arc;

use crate::collab::Classifier;
use crate::core::DialogError;

pub use context::{ContextPolicy, ContextScope};
pub use event::{Event, RawEvent};
pub use intent::{Intent, IntentKind, IntentTable};

/// 每个会话共享的路由器（无会话状态，上下文由调用方传入）
pub struct EventRouter {
    table: IntentTable,
    max_attachment_bytes: u64,
    classifier: Arc<dyn Classifier>,
}

impl EventRouter {
    pub fn new(table: IntentTable, max_attachment_bytes: u64, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            table,
            max_attachment_bytes,
            classifier,
        }
    }

    pub fn max_attachment_bytes(&self) -> u64 {
        self.max_attachment_bytes
    }

    /// 分类一个原始事件
    ///
    /// 分类服务失败时返回 `ExternalService`，上下文保持不变（包括待重置标记）。
    pub async fn classify(
        &self,
        session_id: &str,
        scope: &mut ContextScope,
        policy: ContextPolicy,
        raw: RawEvent,
    ) -> Result<Event, DialogError> {
        match raw {
            RawEvent::Text(text) => {
                let contexts = scope.to_vec();
                let result = self
                    .classifier
                    .classify(session_id, &text, &contexts, scope.reset_pending())
                    .await?;
                scope.clear_reset();

                if scope.apply(policy, &result.contexts) {
                    tracing::debug!(
                        session_id,
                        policy = ?policy,
                        contexts = ?scope.to_vec(),
                        "context scope updated"
                    );
                }

                let intent = self.table.resolve(&result);
                tracing::debug!(session_id, intent = ?intent, "text classified");
                Ok(Event::Text { text, intent })
            }
            RawEvent::Attachment(attachment) => {
                let rejected = attachment.size_bytes > self.max_attachment_bytes;
                if rejected {
                    tracing::warn!(
                        session_id,
                        name = %attachment.name,
                        size = attachment.size_bytes,
                        limit = self.max_attachment_bytes,
                        "attachment over size limit"
                    );
                }
                Ok(Event::Attachment {
                    attachment,
                    rejected,
                })
            }
            RawEvent::Callback(data) => Ok(Event::Callback(data)),
            RawEvent::TimerTick { .. } => Ok(Event::TimerTick),
            RawEvent::JobFinished { result, .. } => Ok(Event::AsyncCompletion(result)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::ScriptedClassifier;
    use crate::collab::{AttachmentRef, ClassificationResult, CollabError};

    fn router(classifier: Arc<ScriptedClassifier>) -> EventRouter {
        EventRouter::new(IntentTable::default(), 20_000_000, classifier)
    }

    #[tokio::test]
    async fn test_oversize_attachment_skips_classifier() {
        let classifier = Arc::new(ScriptedClassifier::new());
        let router = router(classifier.clone());
        let mut scope = ContextScope::new();

        let event = router
            .classify(
                "s1",
                &mut scope,
                ContextPolicy::MultiToggle,
                RawEvent::Attachment(AttachmentRef {
                    name: "huge.stl".to_string(),
                    size_bytes: 21_000_000,
                    file_ref: "f1".to_string(),
                }),
            )
            .await
            .unwrap();

        assert!(matches!(event, Event::Attachment { rejected: true, .. }));
        assert_eq!(classifier.call_count(), 0);
    }

    #[tokio::test]
    async fn test_text_passes_scope_and_applies_policy() {
        let classifier = Arc::new(ScriptedClassifier::new());
        classifier.push(ClassificationResult::new("affirm").with_contexts(&["A"]));
        classifier.push(ClassificationResult::new("affirm").with_contexts(&["A"]));
        let router = router(classifier.clone());

        let mut single: ContextScope = ["A"].into_iter().collect();
        router
            .classify("s1", &mut single, ContextPolicy::SingleReplace, RawEvent::Text("yes".into()))
            .await
            .unwrap();
        assert_eq!(single.to_vec(), vec!["A"]);

        let mut multi: ContextScope = ["A"].into_iter().collect();
        let event = router
            .classify("s1", &mut multi, ContextPolicy::MultiToggle, RawEvent::Text("yes".into()))
            .await
            .unwrap();
        assert!(multi.is_empty());
        assert!(event.is_affirm());

        assert_eq!(classifier.calls()[0].contexts, vec!["A"]);
    }

    #[tokio::test]
    async fn test_reset_flag_cleared_only_on_success() {
        let classifier = Arc::new(ScriptedClassifier::new());
        classifier.push_error(CollabError::ClassificationUnavailable("down".into()));
        classifier.push(ClassificationResult::new("greeting"));
        let router = router(classifier.clone());

        let mut scope = ContextScope::new();
        scope.reset();

        let err = router
            .classify("s1", &mut scope, ContextPolicy::MultiToggle, RawEvent::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::ExternalService(_)));
        assert!(scope.reset_pending());

        router
            .classify("s1", &mut scope, ContextPolicy::MultiToggle, RawEvent::Text("hi".into()))
            .await
            .unwrap();
        assert!(!scope.reset_pending());

        let calls = classifier.calls();
        assert!(calls[0].reset_contexts);
        assert!(calls[1].reset_contexts);
    }

    #[tokio::test]
    async fn test_callback_not_classified() {
        let classifier = Arc::new(ScriptedClassifier::new());
        let router = router(classifier.clone());
        let mut scope = ContextScope::new();
        let event = router
            .classify("s1", &mut scope, ContextPolicy::MultiToggle, RawEvent::Callback("yes".into()))
            .await
            .unwrap();
        assert!(event.is_affirm());
        assert_eq!(classifier.call_count(), 0);
    }
}
