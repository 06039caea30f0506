//! 子对话：面向单个任务的嵌套状态机
//!
//! 每个子对话都基于 `fsm` 引擎，对外只暴露 `start` / `handle_event`，以及一个只能发出
//! 一次的终态信号（Completed / Canceled / Failed）。编排器创建子对话时拿到信号的接收端，
//! 收到后立即结束订阅并清空活动子对话。子对话内部状态对编排器不可见。

pub mod checklist;
pub mod model_search;
pub mod object_collection;
pub mod slicing;
pub mod tutorial;

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::collab::{Collaborators, JobCompletion, Keyboard, MessageId};
use crate::config::DialogSection;
use crate::core::DialogError;
use crate::fsm::FireOutcome;
use crate::router::{ContextPolicy, Event, RawEvent};

pub use checklist::ChecklistDialog;
pub use model_search::ModelSearchDialog;
pub use object_collection::ObjectCollectionDialog;
pub use slicing::SlicingDialog;
pub use tutorial::TutorialDialog;

/// 子对话实例 ID（进程内单调递增）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct DialogInstanceId(u64);

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

impl DialogInstanceId {
    pub fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DialogInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dlg-{}", self.0)
    }
}

/// 子对话种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    HardwareTutorial,
    WorkflowTutorial,
    ObjectCollection,
    ModelSearch,
    Slicing,
    Checklist,
}

impl DialogKind {
    /// 静态文案中的 dialog id
    pub fn content_id(&self) -> &'static str {
        match self {
            DialogKind::HardwareTutorial => "hardware_tutorial",
            DialogKind::WorkflowTutorial => "workflow_tutorial",
            DialogKind::ObjectCollection => "object_collection",
            DialogKind::ModelSearch => "model_search",
            DialogKind::Slicing => "slicing",
            DialogKind::Checklist => "checklist",
        }
    }
}

/// 完成时携带的结果
#[derive(Debug, Clone, PartialEq)]
pub enum DialogResult {
    /// 教程等无数据的完成
    Acknowledged,
    PrintObject(String),
    ModelChosen { name: String, link: String },
    Sliced(JobCompletion),
    ChecklistPassed,
}

/// 子对话终态
#[derive(Debug, Clone, PartialEq)]
pub enum DialogOutcome {
    Completed(DialogResult),
    Canceled,
    Failed(String),
}

/// 终态信号的接收端（编排器持有）
pub type OutcomeReceiver = oneshot::Receiver<DialogOutcome>;

/// 终态信号的发送端：只能发出一次
#[derive(Debug)]
pub struct OutcomeSignal {
    tx: Option<oneshot::Sender<DialogOutcome>>,
}

impl OutcomeSignal {
    pub fn channel() -> (Self, OutcomeReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// 第二次发出，或没有订阅者，都视为不变量被破坏
    pub fn raise(&mut self, outcome: DialogOutcome) -> Result<(), DialogError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DialogError::invariant("dialog outcome raised twice"))?;
        tx.send(outcome)
            .map_err(|_| DialogError::invariant("dialog outcome raised without a subscriber"))
    }

    pub fn is_raised(&self) -> bool {
        self.tx.is_none()
    }
}

/// 子对话运行所需的一切：会话 id、协作者、配置、回投队列、取消令牌、终态信号
pub struct DialogContext {
    pub session_id: String,
    pub instance: DialogInstanceId,
    pub collab: Collaborators,
    pub settings: Arc<DialogSection>,
    /// 会话队列：定时器和任务回调经此回到串行化点
    pub inbound: mpsc::UnboundedSender<RawEvent>,
    /// 实例级取消令牌（会话根令牌的子令牌）
    pub cancel: CancellationToken,
    signal: OutcomeSignal,
}

impl DialogContext {
    pub fn new(
        session_id: impl Into<String>,
        instance: DialogInstanceId,
        collab: Collaborators,
        settings: Arc<DialogSection>,
        inbound: mpsc::UnboundedSender<RawEvent>,
        cancel: CancellationToken,
    ) -> (Self, OutcomeReceiver) {
        let (signal, rx) = OutcomeSignal::channel();
        (
            Self {
                session_id: session_id.into(),
                instance,
                collab,
                settings,
                inbound,
                cancel,
                signal,
            },
            rx,
        )
    }

    /// 发送一条静态文案：先发媒体，再发带键盘的文本
    pub async fn present(
        &self,
        dialog_id: &str,
        state_id: &str,
        vars: &[(&str, &str)],
    ) -> Result<MessageId, DialogError> {
        self.present_with(dialog_id, state_id, vars, None).await
    }

    /// 同 `present`，但可用动态键盘替换文案中的键盘
    pub async fn present_with(
        &self,
        dialog_id: &str,
        state_id: &str,
        vars: &[(&str, &str)],
        keyboard: Option<Keyboard>,
    ) -> Result<MessageId, DialogError> {
        let content = self.collab.content.get_message(dialog_id, state_id)?;
        if !content.media.is_empty() {
            self.collab
                .transport
                .send_media(&self.session_id, &content.media, None)
                .await?;
        }
        let text = content.render(vars);
        let keyboard = keyboard.or(content.keyboard);
        let id = self
            .collab
            .transport
            .send_text(&self.session_id, &text, keyboard.as_ref())
            .await?;
        Ok(id)
    }

    /// 终态的收尾消息：此时终态信号已发出，投递失败只记日志
    pub async fn present_closing(&self, dialog_id: &str, state_id: &str, vars: &[(&str, &str)]) {
        if let Err(e) = self.present(dialog_id, state_id, vars).await {
            tracing::warn!(
                session_id = %self.session_id,
                instance = %self.instance,
                state_id,
                "closing message not delivered: {}",
                e
            );
        }
    }

    /// 发送纯文本
    pub async fn say(&self, text: &str) -> Result<MessageId, DialogError> {
        Ok(self
            .collab
            .transport
            .send_text(&self.session_id, text, None)
            .await?)
    }

    /// 发出终态信号
    pub fn raise(&mut self, outcome: DialogOutcome) -> Result<(), DialogError> {
        tracing::info!(
            session_id = %self.session_id,
            instance = %self.instance,
            outcome = ?outcome,
            "dialog finished"
        );
        self.signal.raise(outcome)
    }

    pub fn is_finished(&self) -> bool {
        self.signal.is_raised()
    }
}

/// 子对话能力集
#[async_trait]
pub trait SubDialog: Send + Sync {
    fn kind(&self) -> DialogKind;

    fn instance(&self) -> DialogInstanceId;

    /// 本对话的上下文合并策略
    fn context_policy(&self) -> ContextPolicy;

    /// 启动：可直接越过初始状态并发出第一条消息
    async fn start(&mut self) -> Result<(), DialogError>;

    async fn handle_event(&mut self, event: Event) -> Result<(), DialogError>;

    /// 被编排器撤销时调用，停止本实例的后台任务
    fn teardown(&mut self) {}
}

/// 创建子对话时携带的会话数据
#[derive(Debug, Clone, Default)]
pub struct DialogSeed {
    pub print_object: Option<String>,
    pub search_term: Option<String>,
    pub model_path: Option<String>,
}

/// 按种类构造子对话
pub fn create_dialog(kind: DialogKind, ctx: DialogContext, seed: DialogSeed) -> Box<dyn SubDialog> {
    match kind {
        DialogKind::HardwareTutorial => {
            let steps = ctx.settings.hardware_tutorial_steps.clone();
            Box::new(TutorialDialog::new(kind, steps, ctx))
        }
        DialogKind::WorkflowTutorial => {
            let steps = ctx.settings.workflow_tutorial_steps.clone();
            Box::new(TutorialDialog::new(kind, steps, ctx))
        }
        DialogKind::ObjectCollection => Box::new(ObjectCollectionDialog::new(ctx, seed.print_object)),
        DialogKind::ModelSearch => Box::new(ModelSearchDialog::new(ctx, seed.search_term)),
        DialogKind::Slicing => Box::new(SlicingDialog::new(ctx, seed.model_path.unwrap_or_default())),
        DialogKind::Checklist => {
            let items = ctx.settings.checklist.clone();
            Box::new(ChecklistDialog::new(ctx, items))
        }
    }
}

/// 子对话内部 fire 的结果 → 处理结果
///
/// 当前状态不接受该输入视为用户输入错误（重新提示），动作失败原样上抛。
pub(crate) fn settle<S: Debug>(outcome: FireOutcome<S>, input: &str) -> Result<(), DialogError> {
    match outcome {
        FireOutcome::Transitioned(_) => Ok(()),
        FireOutcome::NoTransition | FireOutcome::GuardRejected => {
            Err(DialogError::user_input(format!("{} not accepted here", input)))
        }
        FireOutcome::ActionFailed { error, .. } => Err(error),
    }
}

/// 原始文本（用于自由输入的步骤）
pub(crate) fn event_text(event: &Event) -> Option<&str> {
    match event {
        Event::Text { text, .. } => Some(text.trim()).filter(|t| !t.is_empty()),
        _ => None,
    }
}
