//! 打印前检查：逐项确认，回答「否」则停在 Blocked 直到用户处理好

use async_trait::async_trait;

use super::{
    settle, DialogContext, DialogInstanceId, DialogKind, DialogOutcome, DialogResult, SubDialog,
};
use crate::core::DialogError;
use crate::fsm::{StateActions, StateMachine, TransitionTable};
use crate::router::{ContextPolicy, Event};

const CONTENT: &str = "checklist";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckState {
    Init,
    Checking,
    Blocked,
    Done,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTrigger {
    Begin,
    Confirm,
    Decline,
    Resume,
    Cancel,
}

pub struct CheckData {
    ctx: DialogContext,
    items: Vec<String>,
    /// 已确认的项数；`items[checked]` 是用户看到的当前项
    checked: usize,
    /// 确认后要展示的下一项，送达后才写回 `checked`
    next: Option<usize>,
}

fn has_remaining(d: &CheckData) -> bool {
    d.next.unwrap_or(d.checked) < d.items.len()
}

pub fn table() -> TransitionTable<CheckState, CheckTrigger, CheckData> {
    use CheckState::*;
    use CheckTrigger::*;

    TransitionTable::new()
        .permit_if(Init, Begin, has_remaining, Checking)
        .permit(Init, Begin, Done)
        .permit_if(Checking, Confirm, has_remaining, Checking)
        .permit(Checking, Confirm, Done)
        .permit(Checking, Decline, Blocked)
        .permit(Blocked, Decline, Blocked)
        .permit(Blocked, Resume, Checking)
        .permit_from(&[Checking, Blocked], Cancel, Canceled)
        .on_entry(Checking)
        .on_entry(Blocked)
        .on_entry(Done)
        .on_entry(Canceled)
}

#[async_trait]
impl StateActions<CheckState, CheckTrigger> for CheckData {
    async fn on_entry(&mut self, state: CheckState) -> Result<Option<CheckTrigger>, DialogError> {
        match state {
            CheckState::Checking => {
                let index = self.next.unwrap_or(self.checked);
                let item = self
                    .items
                    .get(index)
                    .cloned()
                    .ok_or_else(|| DialogError::invariant("checklist cursor out of range"))?;
                self.ctx.present(CONTENT, &item, &[]).await?;
                self.checked = index;
            }
            CheckState::Blocked => {
                self.ctx.present(CONTENT, "blocked", &[]).await?;
            }
            CheckState::Done => {
                self.checked = self.items.len();
                self.ctx
                    .raise(DialogOutcome::Completed(DialogResult::ChecklistPassed))?;
                self.ctx.present_closing(CONTENT, "done", &[]).await;
            }
            CheckState::Canceled => self.ctx.raise(DialogOutcome::Canceled)?,
            CheckState::Init => {}
        }
        Ok(None)
    }
}

/// 打印前检查对话
pub struct ChecklistDialog {
    machine: StateMachine<CheckState>,
    table: TransitionTable<CheckState, CheckTrigger, CheckData>,
    data: CheckData,
}

impl ChecklistDialog {
    /// `items` 为文案中的 state id，按顺序逐项询问
    pub fn new(ctx: DialogContext, items: Vec<String>) -> Self {
        Self {
            machine: StateMachine::new("checklist", CheckState::Init),
            table: table(),
            data: CheckData {
                ctx,
                items,
                checked: 0,
                next: None,
            },
        }
    }

    pub fn state(&self) -> CheckState {
        self.machine.state()
    }

    pub fn checked(&self) -> usize {
        self.data.checked
    }

    async fn fire(&mut self, trigger: CheckTrigger) -> Result<(), DialogError> {
        let outcome = self.machine.fire(&self.table, &mut self.data, trigger).await;
        self.data.next = None;
        settle(outcome, &format!("{:?}", trigger))
    }
}

#[async_trait]
impl SubDialog for ChecklistDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::Checklist
    }

    fn instance(&self) -> DialogInstanceId {
        self.data.ctx.instance
    }

    fn context_policy(&self) -> ContextPolicy {
        ContextPolicy::MultiToggle
    }

    async fn start(&mut self) -> Result<(), DialogError> {
        self.fire(CheckTrigger::Begin).await
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), DialogError> {
        if event.is_cancel() {
            return self.fire(CheckTrigger::Cancel).await;
        }

        match (self.machine.state(), event.is_affirm(), event.is_deny()) {
            (CheckState::Checking, true, _) => {
                self.data.next = Some(self.data.checked + 1);
                self.fire(CheckTrigger::Confirm).await
            }
            (CheckState::Checking | CheckState::Blocked, _, true) => {
                self.fire(CheckTrigger::Decline).await
            }
            (CheckState::Blocked, true, _) => self.fire(CheckTrigger::Resume).await,
            _ => Err(DialogError::user_input("expected yes or no")),
        }
    }
}
