//! 编排器：每个会话一个的顶层状态机
//!
//! 负责：持有会话数据与「当前活动子对话」；入站事件先经 EventRouter 分类，
//! 有活动子对话时原样转交，否则按自身转移表处理。子对话的终态信号在每个事件处理完后
//! 统一结算：结束订阅、吸收结果、触发对应的顶层转移（可能立刻启动下一个子对话）。
//!
//! 所有错误都在这里收口：交给 RecoveryEngine 得到用户可见动作并发送，状态不因此改变。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::collab::{AttachmentRef, Collaborators};
use crate::config::DialogSection;
use crate::core::{
    DialogError, OrchestratorState, RecoveryAction, RecoveryEngine, SessionSnapshot,
    SessionSupervisor,
};
use crate::dialogs::{
    create_dialog, DialogContext, DialogInstanceId, DialogKind, DialogOutcome, DialogResult,
    DialogSeed, OutcomeReceiver, SubDialog,
};
use crate::fsm::{FireOutcome, StateActions, StateMachine, TransitionTable, MAX_CHAIN_DEPTH};
use crate::gateway::Session;
use crate::router::{ContextPolicy, Event, EventRouter, Intent, IntentTable, RawEvent};

const CONTENT: &str = "orchestrator";

/// 没有活动子对话时使用的上下文策略
const TOP_LEVEL_POLICY: ContextPolicy = ContextPolicy::MultiToggle;

/// 顶层触发器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchTrigger {
    Contact,
    NameRequested,
    NameEntered,
    StartCollecting,
    StartSearch,
    HardwareTutorial,
    WorkflowTutorial,
    StartChecklist,
    ModelUploaded,
    StartSlicing,
    Dismiss,
    DialogCompleted,
    DialogCanceled,
    DialogFailed,
    Cancel,
}

/// 处理完一个事件后会话是否继续
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Terminate,
}

pub type OrchestratorTable = TransitionTable<OrchestratorState, OrchTrigger, OrchData>;

const DELEGATING: [OrchestratorState; 6] = [
    OrchestratorState::HardwareTutorial,
    OrchestratorState::WorkflowTutorial,
    OrchestratorState::CollectingObject,
    OrchestratorState::SearchingModel,
    OrchestratorState::Slicing,
    OrchestratorState::Checklist,
];

fn has_user_name(d: &OrchData) -> bool {
    d.session.user_name.is_some()
}

fn has_model(d: &OrchData) -> bool {
    d.session.selected_model_path.is_some()
}

/// 顶层转移表（启动时构建一次，所有会话共享）
pub fn build_table() -> OrchestratorTable {
    use OrchTrigger::*;
    use OrchestratorState as S;

    let mut table = TransitionTable::new()
        .permit(S::Connected, Contact, S::Starting)
        .permit(S::Starting, NameRequested, S::EnteringName)
        .permit_if(S::EnteringName, NameEntered, has_user_name, S::Idle)
        .permit(S::Idle, StartCollecting, S::CollectingObject)
        .permit(S::Idle, StartSearch, S::SearchingModel)
        .permit(S::Idle, HardwareTutorial, S::HardwareTutorial)
        .permit(S::Idle, WorkflowTutorial, S::WorkflowTutorial)
        .permit(S::Idle, StartChecklist, S::Checklist)
        .permit_if(S::Idle, ModelUploaded, has_model, S::ModelReceived)
        .permit_if(S::ModelReceived, ModelUploaded, has_model, S::ModelReceived)
        .permit_if(S::Idle, StartSlicing, has_model, S::Slicing)
        .permit_if(S::ModelReceived, StartSlicing, has_model, S::Slicing)
        .permit(S::ModelReceived, Dismiss, S::Idle)
        .permit(S::CollectingObject, DialogCompleted, S::SearchingModel)
        .permit(S::SearchingModel, DialogCompleted, S::ModelReceived)
        .permit(S::Slicing, DialogCompleted, S::Checklist)
        .permit(S::Checklist, DialogCompleted, S::Idle)
        .permit(S::HardwareTutorial, DialogCompleted, S::Idle)
        .permit(S::WorkflowTutorial, DialogCompleted, S::Idle)
        .permit_from(&DELEGATING, DialogCanceled, S::Idle)
        .permit_from(&DELEGATING, DialogFailed, S::Idle)
        .permit_from(&[S::Idle, S::EnteringName], Cancel, S::Ended)
        .permit(S::ModelReceived, Cancel, S::Idle)
        .on_entry(S::Starting)
        .on_entry(S::EnteringName)
        .on_entry(S::Idle)
        .on_entry(S::ModelReceived)
        .on_entry(S::Ended);

    for state in DELEGATING {
        table = table.on_entry(state).on_exit(state);
    }
    table
}

/// 所有会话共享的只读依赖（启动时构建）
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub collab: Collaborators,
    pub router: Arc<EventRouter>,
    pub settings: Arc<DialogSection>,
    pub table: Arc<OrchestratorTable>,
}

impl OrchestratorDeps {
    pub fn new(collab: Collaborators, settings: DialogSection, intents: IntentTable) -> Self {
        let router = EventRouter::new(
            intents,
            settings.max_attachment_bytes,
            collab.classifier.clone(),
        );
        Self {
            collab,
            router: Arc::new(router),
            settings: Arc::new(settings),
            table: Arc::new(build_table()),
        }
    }
}

struct ActiveDialog {
    dialog: Box<dyn SubDialog>,
    outcome: OutcomeReceiver,
}

/// 顶层状态机的上下文：会话数据、协作者、活动子对话
pub struct OrchData {
    session: Session,
    collab: Collaborators,
    settings: Arc<DialogSection>,
    inbound: mpsc::UnboundedSender<RawEvent>,
    supervisor: SessionSupervisor,
    recovery: RecoveryEngine,
    active: Option<ActiveDialog>,
    /// 进入过的状态（按顺序），用于诊断
    visited: Vec<OrchestratorState>,
}

const VISITED_LIMIT: usize = 64;

impl OrchData {
    async fn present(&self, state_id: &str, vars: &[(&str, &str)]) -> Result<(), DialogError> {
        let content = self.collab.content.get_message(CONTENT, state_id)?;
        if !content.media.is_empty() {
            self.collab
                .transport
                .send_media(&self.session.id, &content.media, None)
                .await?;
        }
        self.collab
            .transport
            .send_text(
                &self.session.id,
                &content.render(vars),
                content.keyboard.as_ref(),
            )
            .await?;
        Ok(())
    }

    async fn present_idle(&self) -> Result<(), DialogError> {
        let name = self.session.user_name.clone().unwrap_or_else(|| "there".to_string());
        self.present("idle", &[("name", name.as_str())]).await
    }

    async fn send_action(&self, action: &RecoveryAction) {
        if let Err(e) = self
            .collab
            .transport
            .send_text(&self.session.id, action.text(), None)
            .await
        {
            tracing::error!(session_id = %self.session.id, "failed to deliver recovery message: {}", e);
        }
    }

    /// 进入委托状态：构造子对话、订阅终态信号、启动
    async fn begin_dialog(&mut self, kind: DialogKind) -> Result<Option<OrchTrigger>, DialogError> {
        let instance = DialogInstanceId::next();
        let cancel = self.supervisor.begin_instance(instance);
        let (ctx, outcome) = DialogContext::new(
            self.session.id.clone(),
            instance,
            self.collab.clone(),
            self.settings.clone(),
            self.inbound.clone(),
            cancel,
        );
        let seed = DialogSeed {
            print_object: self.session.pending_print_object.clone(),
            search_term: self.session.pending_search_term.take(),
            model_path: self.session.selected_model_path.clone(),
        };

        self.session.context_scope.reset();
        let mut dialog = create_dialog(kind, ctx, seed);
        tracing::info!(session_id = %self.session.id, dialog = ?kind, instance = %instance, "dialog started");

        let started = dialog.start().await;
        self.active = Some(ActiveDialog { dialog, outcome });

        match started {
            Ok(()) => Ok(None),
            Err(e) => {
                let action = self.recovery.handle(&self.session.id, &e);
                self.send_action(&action).await;
                Ok(Some(OrchTrigger::DialogFailed))
            }
        }
    }

    /// 结束当前子对话：撤销订阅，停止其后台任务。可重复调用
    fn end_dialog(&mut self) -> Option<DialogKind> {
        let active = self.active.take()?;
        let mut dialog = active.dialog;
        dialog.teardown();
        self.supervisor.end_instance();
        Some(dialog.kind())
    }

    /// 吸收子对话结果，返回对应的顶层触发器
    async fn absorb(&mut self, kind: DialogKind, outcome: DialogOutcome) -> OrchTrigger {
        match outcome {
            DialogOutcome::Completed(result) => {
                match result {
                    DialogResult::PrintObject(object) => {
                        self.session.pending_search_term = Some(object.clone());
                        self.session.pending_print_object = Some(object);
                    }
                    DialogResult::ModelChosen { name, link } => {
                        self.session.selected_model_name = Some(name);
                        self.session.selected_model_path = Some(link);
                    }
                    DialogResult::Sliced(done) => self.session.last_slice = Some(done),
                    DialogResult::ChecklistPassed => self.session.clear_task(),
                    DialogResult::Acknowledged => {}
                }
                OrchTrigger::DialogCompleted
            }
            DialogOutcome::Canceled => OrchTrigger::DialogCanceled,
            DialogOutcome::Failed(reason) => {
                let action = self
                    .recovery
                    .dialog_failed(&self.session.id, kind.content_id(), &reason);
                self.send_action(&action).await;
                OrchTrigger::DialogFailed
            }
        }
    }

    async fn store_attachment(&mut self, attachment: &AttachmentRef) -> Result<(), DialogError> {
        let path = self
            .collab
            .attachments
            .persist(&self.session.id, attachment)
            .await?;
        tracing::info!(
            session_id = %self.session.id,
            name = %attachment.name,
            path = %path.display(),
            "model stored"
        );
        self.session.selected_model_path = Some(path.to_string_lossy().to_string());
        self.session.selected_model_name = Some(attachment.name.clone());
        Ok(())
    }
}

#[async_trait]
impl StateActions<OrchestratorState, OrchTrigger> for OrchData {
    async fn on_exit(&mut self, state: OrchestratorState) -> Result<(), DialogError> {
        if state.delegated_dialog().is_some() {
            self.end_dialog();
        }
        Ok(())
    }

    async fn on_entry(&mut self, state: OrchestratorState) -> Result<Option<OrchTrigger>, DialogError> {
        if self.visited.len() >= VISITED_LIMIT {
            self.visited.remove(0);
        }
        self.visited.push(state);

        if let Some(kind) = state.delegated_dialog() {
            return self.begin_dialog(kind).await;
        }

        match state {
            OrchestratorState::Starting => {
                self.present("starting", &[]).await?;
                return Ok(Some(OrchTrigger::NameRequested));
            }
            OrchestratorState::EnteringName => self.present("entering_name", &[]).await?,
            OrchestratorState::Idle => self.present_idle().await?,
            OrchestratorState::ModelReceived => {
                let model = self.session.selected_model_name.clone().unwrap_or_default();
                self.present("model_received", &[("model", model.as_str())])
                    .await?;
            }
            OrchestratorState::Ended => {
                let name = self.session.user_name.clone().unwrap_or_default();
                self.present("goodbye", &[("name", name.as_str())]).await?;
            }
            _ => {}
        }
        Ok(None)
    }
}

/// 单个会话的编排器
pub struct Orchestrator {
    machine: StateMachine<OrchestratorState>,
    table: Arc<OrchestratorTable>,
    router: Arc<EventRouter>,
    data: OrchData,
    processed: u64,
}

impl Orchestrator {
    /// `inbound` 是本会话队列的发送端，子对话的定时器与任务回调经它回到串行化点
    pub fn new(
        session_id: impl Into<String>,
        deps: &OrchestratorDeps,
        inbound: mpsc::UnboundedSender<RawEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            machine: StateMachine::new("orchestrator", OrchestratorState::Connected),
            table: deps.table.clone(),
            router: deps.router.clone(),
            data: OrchData {
                session: Session::new(session_id),
                collab: deps.collab.clone(),
                settings: deps.settings.clone(),
                inbound,
                supervisor: SessionSupervisor::new(cancel),
                recovery: RecoveryEngine::new(),
                active: None,
                visited: Vec::new(),
            },
            processed: 0,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.machine.state()
    }

    pub fn session(&self) -> &Session {
        &self.data.session
    }

    pub fn active_dialog(&self) -> Option<DialogKind> {
        self.data.active.as_ref().map(|a| a.dialog.kind())
    }

    pub fn active_instance(&self) -> Option<DialogInstanceId> {
        self.data.supervisor.active_instance()
    }

    /// 依次进入过的状态（不含初始状态）
    pub fn visited(&self) -> &[OrchestratorState] {
        &self.data.visited
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = &self.data.session;
        SessionSnapshot {
            session_id: session.id.clone(),
            state: self.machine.state(),
            active_dialog: self.active_dialog(),
            user_name: session.user_name.clone(),
            pending_print_object: session.pending_print_object.clone(),
            selected_model_path: session.selected_model_path.clone(),
            context_scope: session.context_scope.to_vec(),
            processed: self.processed,
            last_activity_at: session.last_activity_at.timestamp_millis(),
        }
    }

    /// 会话被移除：撤销子对话与所有后台任务
    pub fn shutdown(&mut self) {
        self.data.end_dialog();
        self.data.supervisor.cancel();
    }

    /// 处理一个入站事件；返回前本事件引起的全部转移（含链式触发与子对话结算）都已完成
    pub async fn handle(&mut self, raw: RawEvent) -> Disposition {
        self.processed += 1;
        self.data.session.touch();

        if let Some(instance) = raw.instance() {
            if !self.data.supervisor.is_current(instance) {
                tracing::warn!(
                    session_id = %self.data.session.id,
                    instance = %instance,
                    kind = raw.kind(),
                    "late event from a finished dialog discarded"
                );
                return self.disposition();
            }
        }

        if let Err(err) = self.process(raw).await {
            self.recover(&err).await;
        }
        self.settle_outcomes().await;
        self.disposition()
    }

    fn disposition(&self) -> Disposition {
        if self.machine.state() == OrchestratorState::Ended {
            Disposition::Terminate
        } else {
            Disposition::Continue
        }
    }

    async fn process(&mut self, raw: RawEvent) -> Result<(), DialogError> {
        let policy = self
            .data
            .active
            .as_ref()
            .map(|a| a.dialog.context_policy())
            .unwrap_or(TOP_LEVEL_POLICY);

        let event = self
            .router
            .classify(
                &self.data.session.id,
                &mut self.data.session.context_scope,
                policy,
                raw,
            )
            .await?;

        if let Event::Attachment {
            attachment,
            rejected: true,
        } = &event
        {
            return Err(DialogError::ResourceLimit {
                size: attachment.size_bytes,
                limit: self.router.max_attachment_bytes(),
            });
        }

        if let Some(active) = self.data.active.as_mut() {
            return active.dialog.handle_event(event).await;
        }
        self.handle_directly(event).await
    }

    /// 没有活动子对话时按当前顶层状态处理
    async fn handle_directly(&mut self, event: Event) -> Result<(), DialogError> {
        match self.machine.state() {
            OrchestratorState::Connected => self.fire(OrchTrigger::Contact).await,
            OrchestratorState::EnteringName => {
                if event.is_cancel() {
                    return self.fire(OrchTrigger::Cancel).await;
                }
                let name = match &event {
                    Event::Text {
                        intent: Intent::ProvideName { name: Some(name) },
                        ..
                    } => name.clone(),
                    Event::Text {
                        text,
                        intent: Intent::ProvideName { name: None } | Intent::Unknown { .. },
                    } => text.trim().to_string(),
                    _ => return Err(DialogError::user_input("expected a name")),
                };
                if name.is_empty() {
                    return Err(DialogError::user_input("empty name"));
                }
                self.data.session.user_name = Some(name);
                self.fire(OrchTrigger::NameEntered).await
            }
            OrchestratorState::Idle => self.handle_idle(event).await,
            OrchestratorState::ModelReceived => {
                if let Event::Attachment { attachment, .. } = &event {
                    self.data.store_attachment(attachment).await?;
                    return self.fire(OrchTrigger::ModelUploaded).await;
                }
                if event.is_cancel() {
                    self.fire(OrchTrigger::Cancel).await
                } else if event.is_affirm() || event.intent() == Some(&Intent::StartSlicing) {
                    self.fire(OrchTrigger::StartSlicing).await
                } else if event.is_deny() {
                    self.fire(OrchTrigger::Dismiss).await
                } else {
                    Err(DialogError::user_input("expected yes or no"))
                }
            }
            OrchestratorState::Ended => {
                tracing::debug!(session_id = %self.data.session.id, "event after session end ignored");
                Ok(())
            }
            state => Err(DialogError::invariant(format!(
                "{:?} has no active dialog",
                state
            ))),
        }
    }

    async fn handle_idle(&mut self, event: Event) -> Result<(), DialogError> {
        let trigger = match &event {
            Event::Attachment { attachment, .. } => {
                self.data.store_attachment(attachment).await?;
                OrchTrigger::ModelUploaded
            }
            Event::Callback(data) => match data.as_str() {
                "menu:print" => OrchTrigger::StartCollecting,
                "menu:search" => OrchTrigger::StartSearch,
                "menu:hardware_tutorial" => OrchTrigger::HardwareTutorial,
                "menu:workflow_tutorial" => OrchTrigger::WorkflowTutorial,
                "menu:checklist" => OrchTrigger::StartChecklist,
                "cancel" => OrchTrigger::Cancel,
                other => return Err(DialogError::user_input(format!("unknown button {}", other))),
            },
            Event::Text { intent, .. } => match intent {
                Intent::DescribeObject { description } => {
                    self.data.session.pending_print_object = description.clone();
                    OrchTrigger::StartCollecting
                }
                Intent::SearchModel { term } => {
                    self.data.session.pending_search_term = term.clone();
                    OrchTrigger::StartSearch
                }
                Intent::HardwareTutorial => OrchTrigger::HardwareTutorial,
                Intent::WorkflowTutorial => OrchTrigger::WorkflowTutorial,
                Intent::StartChecklist => OrchTrigger::StartChecklist,
                Intent::StartSlicing => OrchTrigger::StartSlicing,
                Intent::Cancel => OrchTrigger::Cancel,
                Intent::Greeting | Intent::Help => return self.data.present_idle().await,
                other => {
                    return Err(DialogError::user_input(format!(
                        "{:?} not available in the menu",
                        other
                    )))
                }
            },
            Event::TimerTick | Event::AsyncCompletion(_) => {
                return Err(DialogError::invariant("background event without an active dialog"))
            }
        };
        self.fire(trigger).await
    }

    /// 顶层 fire：无规则是不变量错误，守卫拒绝是用户输入错误
    async fn fire(&mut self, trigger: OrchTrigger) -> Result<(), DialogError> {
        let from = self.machine.state();
        let outcome = self.machine.fire(&self.table, &mut self.data, trigger).await;
        tracing::debug!(
            session_id = %self.data.session.id,
            from = ?from,
            trigger = ?trigger,
            outcome = ?outcome,
            "orchestrator fired"
        );
        match outcome {
            FireOutcome::Transitioned(_) => Ok(()),
            FireOutcome::NoTransition => Err(DialogError::invariant(format!(
                "no transition for {:?} in {:?}",
                trigger, from
            ))),
            FireOutcome::GuardRejected => Err(DialogError::user_input(format!(
                "{:?} not possible yet",
                trigger
            ))),
            FireOutcome::ActionFailed { error, .. } => Err(error),
        }
    }

    /// 结算子对话终态；一个终态触发的转移可能启动下一个子对话，它也可能立刻结束
    async fn settle_outcomes(&mut self) {
        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(active) = self.data.active.as_mut() else {
                return;
            };
            let outcome = match active.outcome.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Closed) => {
                    let err = DialogError::invariant("dialog dropped its outcome signal");
                    self.recover(&err).await;
                    DialogOutcome::Failed(err.to_string())
                }
            };

            let Some(kind) = self.data.end_dialog() else {
                return;
            };
            let trigger = self.data.absorb(kind, outcome).await;
            if let Err(err) = self.fire(trigger).await {
                self.recover(&err).await;
            }
        }
        tracing::error!(session_id = %self.data.session.id, "dialog outcomes kept chaining, giving up");
    }

    async fn recover(&mut self, err: &DialogError) {
        let action = self.data.recovery.handle(&self.data.session.id, err);
        self.data.send_action(&action).await;
    }
}
