//! 教程：按步骤翻页展示静态文案（媒体先于文本），支持前进 / 后退
//!
//! 硬件教程与流程教程共用同一实现，只是文案 id 和步骤不同。

use async_trait::async_trait;

use super::{
    settle, DialogContext, DialogInstanceId, DialogKind, DialogOutcome, DialogResult, SubDialog,
};
use crate::core::DialogError;
use crate::fsm::{StateActions, StateMachine, TransitionTable};
use crate::router::{ContextPolicy, Event, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TutorialState {
    Init,
    Showing,
    Finished,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TutorialTrigger {
    Begin,
    Next,
    Back,
    Cancel,
}

pub struct TutorialData {
    ctx: DialogContext,
    content_id: &'static str,
    steps: Vec<String>,
    cursor: usize,
    /// 翻页目标，由处理器在 fire 前写入
    target: Option<usize>,
}

fn target_in_range(d: &TutorialData) -> bool {
    d.target.map_or(false, |t| t < d.steps.len())
}

pub fn table() -> TransitionTable<TutorialState, TutorialTrigger, TutorialData> {
    use TutorialState::*;
    use TutorialTrigger::*;

    TransitionTable::new()
        .permit_if(Init, Begin, target_in_range, Showing)
        .permit(Init, Begin, Finished)
        .permit_if(Showing, Next, target_in_range, Showing)
        .permit(Showing, Next, Finished)
        .permit_if(Showing, Back, target_in_range, Showing)
        .permit(Showing, Cancel, Canceled)
        .on_entry(Showing)
        .on_entry(Finished)
        .on_entry(Canceled)
}

#[async_trait]
impl StateActions<TutorialState, TutorialTrigger> for TutorialData {
    async fn on_entry(&mut self, state: TutorialState) -> Result<Option<TutorialTrigger>, DialogError> {
        match state {
            TutorialState::Showing => {
                // 送达之后才移动游标，失败时重试的还是同一页
                let index = self.target.unwrap_or(self.cursor);
                let step = self
                    .steps
                    .get(index)
                    .cloned()
                    .ok_or_else(|| DialogError::invariant("tutorial cursor out of range"))?;
                self.ctx.present(self.content_id, &step, &[]).await?;
                self.cursor = index;
            }
            TutorialState::Finished => {
                self.ctx
                    .raise(DialogOutcome::Completed(DialogResult::Acknowledged))?;
                self.ctx.present_closing(self.content_id, "finished", &[]).await;
            }
            TutorialState::Canceled => self.ctx.raise(DialogOutcome::Canceled)?,
            TutorialState::Init => {}
        }
        Ok(None)
    }
}

/// 教程对话
pub struct TutorialDialog {
    kind: DialogKind,
    machine: StateMachine<TutorialState>,
    table: TransitionTable<TutorialState, TutorialTrigger, TutorialData>,
    data: TutorialData,
}

impl TutorialDialog {
    pub fn new(kind: DialogKind, steps: Vec<String>, ctx: DialogContext) -> Self {
        Self {
            kind,
            machine: StateMachine::new(kind.content_id(), TutorialState::Init),
            table: table(),
            data: TutorialData {
                ctx,
                content_id: kind.content_id(),
                steps,
                cursor: 0,
                target: None,
            },
        }
    }

    pub fn state(&self) -> TutorialState {
        self.machine.state()
    }

    pub fn cursor(&self) -> usize {
        self.data.cursor
    }

    async fn fire(&mut self, trigger: TutorialTrigger, target: Option<usize>) -> Result<(), DialogError> {
        self.data.target = target;
        let outcome = self.machine.fire(&self.table, &mut self.data, trigger).await;
        self.data.target = None;
        settle(outcome, &format!("{:?}", trigger))
    }
}

#[async_trait]
impl SubDialog for TutorialDialog {
    fn kind(&self) -> DialogKind {
        self.kind
    }

    fn instance(&self) -> DialogInstanceId {
        self.data.ctx.instance
    }

    fn context_policy(&self) -> ContextPolicy {
        ContextPolicy::MultiToggle
    }

    async fn start(&mut self) -> Result<(), DialogError> {
        self.fire(TutorialTrigger::Begin, Some(0)).await
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), DialogError> {
        if event.is_cancel() {
            return self.fire(TutorialTrigger::Cancel, None).await;
        }

        let forward = match &event {
            Event::Callback(data) if data == "tutorial:next" => true,
            Event::Callback(data) if data == "tutorial:back" => false,
            Event::Text {
                intent: Intent::NextPage | Intent::Affirm,
                ..
            } => true,
            _ => return Err(DialogError::user_input("use next or back")),
        };

        let cursor = self.data.cursor;
        if forward {
            self.fire(TutorialTrigger::Next, Some(cursor + 1)).await
        } else {
            self.fire(TutorialTrigger::Back, cursor.checked_sub(1)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::Outbound;
    use crate::config::DialogSection;
    use crate::dialogs::testing::{context, tap};

    fn hardware_steps() -> Vec<String> {
        ["intro", "frame", "extruder", "bed"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_table_is_consistent() {
        assert!(table().validate().is_ok());
    }

    #[tokio::test]
    async fn test_walk_through_with_back() {
        let (ctx, mut h) = context(DialogSection::default());
        let mut dialog = TutorialDialog::new(DialogKind::HardwareTutorial, hardware_steps(), ctx);

        dialog.start().await.unwrap();
        assert_eq!(dialog.cursor(), 0);

        let err = dialog.handle_event(tap("tutorial:back")).await.unwrap_err();
        assert!(matches!(err, DialogError::UserInput(_)));

        dialog.handle_event(tap("tutorial:next")).await.unwrap();
        dialog.handle_event(tap("tutorial:next")).await.unwrap();
        assert_eq!(dialog.cursor(), 2);
        dialog.handle_event(tap("tutorial:back")).await.unwrap();
        assert_eq!(dialog.cursor(), 1);

        dialog.handle_event(tap("tutorial:next")).await.unwrap();
        dialog.handle_event(tap("tutorial:next")).await.unwrap();
        assert_eq!(dialog.cursor(), 3);
        dialog.handle_event(tap("tutorial:next")).await.unwrap();
        assert_eq!(dialog.state(), TutorialState::Finished);
        assert_eq!(
            h.outcome.try_recv().unwrap(),
            DialogOutcome::Completed(DialogResult::Acknowledged)
        );
    }

    #[tokio::test]
    async fn test_media_sent_before_text() {
        let (ctx, h) = context(DialogSection::default());
        let mut dialog = TutorialDialog::new(DialogKind::HardwareTutorial, hardware_steps(), ctx);
        dialog.start().await.unwrap();
        h.transport.clear();

        dialog.handle_event(tap("tutorial:next")).await.unwrap();
        let out = h.transport.outbound();
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Outbound::Media { media, .. } if media[0] == "hardware/frame.jpg"));
        assert!(matches!(&out[1], Outbound::Text { text, .. } if text.contains("frame")));
    }

    #[tokio::test]
    async fn test_undelivered_page_is_shown_again_on_retry() {
        let (ctx, h) = context(DialogSection::default());
        let mut dialog = TutorialDialog::new(DialogKind::HardwareTutorial, hardware_steps(), ctx);
        dialog.start().await.unwrap();
        dialog.handle_event(tap("tutorial:next")).await.unwrap();
        assert_eq!(dialog.cursor(), 1);

        h.transport.set_failing(true);
        let err = dialog.handle_event(tap("tutorial:next")).await.unwrap_err();
        assert!(matches!(err, DialogError::ExternalService(_)));
        assert_eq!(dialog.cursor(), 1);
        assert_eq!(dialog.state(), TutorialState::Showing);

        h.transport.set_failing(false);
        h.transport.clear();
        dialog.handle_event(tap("tutorial:next")).await.unwrap();
        assert_eq!(dialog.cursor(), 2);
        assert!(h.transport.last_text().unwrap().contains("extruder"));
    }

    #[tokio::test]
    async fn test_finish_is_signalled_even_if_closing_message_fails() {
        let (ctx, mut h) = context(DialogSection::default());
        let mut dialog = TutorialDialog::new(DialogKind::WorkflowTutorial, vec!["model".to_string()], ctx);
        dialog.start().await.unwrap();

        h.transport.set_failing(true);
        dialog.handle_event(tap("tutorial:next")).await.unwrap();
        assert_eq!(dialog.state(), TutorialState::Finished);
        assert_eq!(
            h.outcome.try_recv().unwrap(),
            DialogOutcome::Completed(DialogResult::Acknowledged)
        );
    }

    #[tokio::test]
    async fn test_cancel_tutorial() {
        let (ctx, mut h) = context(DialogSection::default());
        let mut dialog = TutorialDialog::new(DialogKind::WorkflowTutorial, vec!["model".to_string()], ctx);
        dialog.start().await.unwrap();
        dialog.handle_event(tap("cancel")).await.unwrap();
        assert_eq!(h.outcome.try_recv().unwrap(), DialogOutcome::Canceled);
    }
}
