//! 打印对象收集：用户描述想打印的东西，确认后完成

use async_trait::async_trait;

use super::{
    event_text, settle, DialogContext, DialogInstanceId, DialogKind, DialogOutcome, DialogResult,
    SubDialog,
};
use crate::core::DialogError;
use crate::fsm::{StateActions, StateMachine, TransitionTable};
use crate::router::{ContextPolicy, Event, Intent};

const CONTENT: &str = "object_collection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectState {
    Init,
    Describing,
    Confirming,
    Done,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectTrigger {
    Begin,
    Described,
    Confirm,
    Reject,
    Cancel,
}

pub struct CollectData {
    ctx: DialogContext,
    description: Option<String>,
}

fn has_description(d: &CollectData) -> bool {
    d.description.is_some()
}

pub fn table() -> TransitionTable<CollectState, CollectTrigger, CollectData> {
    use CollectState::*;
    use CollectTrigger::*;

    TransitionTable::new()
        .permit_if(Init, Begin, has_description, Confirming)
        .permit(Init, Begin, Describing)
        .permit_if(Describing, Described, has_description, Confirming)
        .permit_if(Confirming, Described, has_description, Confirming)
        .permit(Confirming, Confirm, Done)
        .permit(Confirming, Reject, Describing)
        .permit_from(&[Describing, Confirming], Cancel, Canceled)
        .on_entry(Describing)
        .on_entry(Confirming)
        .on_entry(Done)
        .on_entry(Canceled)
}

#[async_trait]
impl StateActions<CollectState, CollectTrigger> for CollectData {
    async fn on_entry(&mut self, state: CollectState) -> Result<Option<CollectTrigger>, DialogError> {
        match state {
            CollectState::Describing => {
                self.description = None;
                self.ctx.present(CONTENT, "describing", &[]).await?;
            }
            CollectState::Confirming => {
                let object = self.description.clone().unwrap_or_default();
                self.ctx
                    .present(CONTENT, "confirming", &[("object", object.as_str())])
                    .await?;
            }
            CollectState::Done => {
                let object = self.description.clone().unwrap_or_default();
                self.ctx
                    .raise(DialogOutcome::Completed(DialogResult::PrintObject(object)))?;
            }
            CollectState::Canceled => self.ctx.raise(DialogOutcome::Canceled)?,
            CollectState::Init => {}
        }
        Ok(None)
    }
}

/// 打印对象收集对话
pub struct ObjectCollectionDialog {
    machine: StateMachine<CollectState>,
    table: TransitionTable<CollectState, CollectTrigger, CollectData>,
    data: CollectData,
}

impl ObjectCollectionDialog {
    /// `seed` 为之前已收集到的描述（例如用户在菜单里直接说了要打印什么）
    pub fn new(ctx: DialogContext, seed: Option<String>) -> Self {
        Self {
            machine: StateMachine::new("object_collection", CollectState::Init),
            table: table(),
            data: CollectData {
                ctx,
                description: seed.filter(|s| !s.trim().is_empty()),
            },
        }
    }

    pub fn state(&self) -> CollectState {
        self.machine.state()
    }

    async fn fire(&mut self, trigger: CollectTrigger) -> Result<(), DialogError> {
        let outcome = self.machine.fire(&self.table, &mut self.data, trigger).await;
        settle(outcome, &format!("{:?}", trigger))
    }
}

#[async_trait]
impl SubDialog for ObjectCollectionDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::ObjectCollection
    }

    fn instance(&self) -> DialogInstanceId {
        self.data.ctx.instance
    }

    fn context_policy(&self) -> ContextPolicy {
        ContextPolicy::MultiToggle
    }

    async fn start(&mut self) -> Result<(), DialogError> {
        self.fire(CollectTrigger::Begin).await
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), DialogError> {
        if event.is_cancel() {
            return self.fire(CollectTrigger::Cancel).await;
        }

        let described = match event.intent() {
            Some(Intent::DescribeObject {
                description: Some(d),
            }) => Some(d.clone()),
            _ => None,
        };

        match self.machine.state() {
            CollectState::Describing => {
                let description = described
                    .or_else(|| event_text(&event).map(|t| t.to_string()))
                    .ok_or_else(|| DialogError::user_input("expected a description"))?;
                self.data.description = Some(description);
                self.fire(CollectTrigger::Described).await
            }
            CollectState::Confirming => {
                if event.is_affirm() {
                    self.fire(CollectTrigger::Confirm).await
                } else if event.is_deny() {
                    self.fire(CollectTrigger::Reject).await
                } else if let Some(d) = described {
                    self.data.description = Some(d);
                    self.fire(CollectTrigger::Described).await
                } else {
                    Err(DialogError::user_input("expected yes or no"))
                }
            }
            state => Err(DialogError::invariant(format!(
                "object collection received input in {:?}",
                state
            ))),
        }
    }
}
