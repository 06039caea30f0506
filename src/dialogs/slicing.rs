//! 切片：收集参数（质量 / 填充率 / 支撑）→ 确认 → 提交任务 → 进度 → 完成摘要
//!
//! 进入 Slicing 时发一条进度消息并启动定时器，每个 tick 经会话队列回到这里，原地编辑同一条
//! 消息。任务完成回调同样经队列回来；Slicing 的出口动作停止定时器，Done 的入口动作只发
//! 一条摘要。提交失败不重试，直接以 Failed 结束。
//!
//! 任务一旦提交，进度消息和摘要的投递失败都只记日志：tick 是后台事件，用户没法重试它。

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use super::{
    event_text, settle, DialogContext, DialogInstanceId, DialogKind, DialogOutcome, DialogResult,
    SubDialog,
};
use crate::collab::{CollabError, JobCompletion, MessageId, SliceParameters};
use crate::core::DialogError;
use crate::fsm::{StateActions, StateMachine, TransitionTable};
use crate::router::{ContextPolicy, Event, Intent, RawEvent};

const CONTENT: &str = "slicing";

const INDICATOR_FRAMES: [&str; 4] = ["", ".", "..", "..."];

/// 打印质量 → 层高（mm）
pub fn layer_height_for(quality: &str) -> Option<f32> {
    match quality.trim().to_lowercase().as_str() {
        "fine" => Some(0.12),
        "normal" | "standard" => Some(0.2),
        "draft" | "fast" => Some(0.28),
        _ => None,
    }
}

/// 填充率：0–100 的整数，可带 `%`
pub fn parse_infill(input: &str) -> Result<u8, DialogError> {
    let re = Regex::new(r"^\s*(\d{1,3})\s*%?\s*$")
        .map_err(|e| DialogError::invariant(format!("infill pattern: {}", e)))?;
    let value: u32 = re
        .captures(input)
        .and_then(|c| c[1].parse().ok())
        .ok_or_else(|| DialogError::user_input(format!("'{}' is not a percentage", input)))?;
    if value > 100 {
        return Err(DialogError::user_input(format!(
            "infill {} is outside 0-100",
            value
        )));
    }
    Ok(value as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceState {
    Init,
    AskingQuality,
    AskingInfill,
    AskingSupports,
    Confirming,
    Submitting,
    Slicing,
    Done,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceTrigger {
    Begin,
    QualityChosen,
    InfillGiven,
    SupportsChosen,
    Confirm,
    Revise,
    Submitted,
    SubmitFailed,
    JobDone,
    JobFailed,
    Cancel,
}

pub struct SliceData {
    ctx: DialogContext,
    model_path: String,
    layer_height: Option<f32>,
    infill: Option<u8>,
    supports: Option<bool>,
    job_id: Option<String>,
    progress_message: Option<MessageId>,
    ticks: usize,
    ticker: Option<CancellationToken>,
    completion: Option<JobCompletion>,
    failure: Option<String>,
}

impl SliceData {
    fn parameters(&self) -> SliceParameters {
        SliceParameters {
            model_path: self.model_path.clone(),
            layer_height_mm: self.layer_height.unwrap_or(0.2),
            infill_percent: self.infill.unwrap_or(20),
            supports: self.supports.unwrap_or(false),
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }

    fn progress_text(&self, indicator: &str) -> Result<String, DialogError> {
        let content = self.ctx.collab.content.get_message(CONTENT, "in_progress")?;
        Ok(content.render(&[("indicator", indicator)]))
    }

    /// 定时器：固定间隔向会话队列投递 TimerTick，直到令牌取消或队列关闭
    fn spawn_ticker(&mut self) {
        let token = self.ctx.cancel.child_token();
        self.ticker = Some(token.clone());

        let tx = self.ctx.inbound.clone();
        let instance = self.ctx.instance;
        let period = Duration::from_millis(self.ctx.settings.tick_interval_ms.max(1));

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if tx.send(RawEvent::TimerTick { instance }).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// 提交任务并把完成结果转发回会话队列
    async fn submit(&mut self) -> Result<(), CollabError> {
        let params = self.parameters();
        let subscription = self.ctx.collab.jobs.submit(&params).await?;
        tracing::info!(
            session_id = %self.ctx.session_id,
            job_id = %subscription.job_id,
            model = %params.model_path,
            "slicing job submitted"
        );
        self.job_id = Some(subscription.job_id);

        let token = self.ctx.cancel.clone();
        let tx = self.ctx.inbound.clone();
        let instance = self.ctx.instance;
        let completion = subscription.completion;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                received = completion => {
                    let result = received.unwrap_or_else(|_| {
                        Err(CollabError::SubmissionFailed("job service dropped the job".to_string()))
                    });
                    let _ = tx.send(RawEvent::JobFinished { instance, result });
                }
            }
        });
        Ok(())
    }
}

fn has_quality(d: &SliceData) -> bool {
    d.layer_height.is_some()
}

fn has_infill(d: &SliceData) -> bool {
    d.infill.is_some()
}

fn has_supports(d: &SliceData) -> bool {
    d.supports.is_some()
}

pub fn table() -> TransitionTable<SliceState, SliceTrigger, SliceData> {
    use SliceState::*;
    use SliceTrigger::*;

    TransitionTable::new()
        .permit(Init, Begin, AskingQuality)
        .permit_if(AskingQuality, QualityChosen, has_quality, AskingInfill)
        .permit_if(AskingInfill, QualityChosen, has_quality, AskingInfill)
        .permit_if(AskingInfill, InfillGiven, has_infill, AskingSupports)
        .permit_if(AskingSupports, InfillGiven, has_infill, AskingSupports)
        .permit_if(AskingSupports, SupportsChosen, has_supports, Confirming)
        .permit(Confirming, Confirm, Submitting)
        .permit(Confirming, Revise, AskingQuality)
        .permit(Submitting, Submitted, Slicing)
        .permit(Submitting, SubmitFailed, Failed)
        .permit(Slicing, JobDone, Done)
        .permit(Slicing, JobFailed, Failed)
        .permit_from(
            &[AskingQuality, AskingInfill, AskingSupports, Confirming, Slicing],
            Cancel,
            Canceled,
        )
        .on_entry(AskingQuality)
        .on_entry(AskingInfill)
        .on_entry(AskingSupports)
        .on_entry(Confirming)
        .on_entry(Submitting)
        .on_entry(Slicing)
        .on_entry(Done)
        .on_entry(Failed)
        .on_entry(Canceled)
        .on_exit(Slicing)
}

#[async_trait]
impl StateActions<SliceState, SliceTrigger> for SliceData {
    async fn on_exit(&mut self, state: SliceState) -> Result<(), DialogError> {
        if state == SliceState::Slicing {
            self.stop_ticker();
        }
        Ok(())
    }

    async fn on_entry(&mut self, state: SliceState) -> Result<Option<SliceTrigger>, DialogError> {
        match state {
            SliceState::AskingQuality => {
                self.layer_height = None;
                self.infill = None;
                self.supports = None;
                self.ctx.present(CONTENT, "asking_quality", &[]).await?;
            }
            SliceState::AskingInfill => {
                self.ctx.present(CONTENT, "asking_infill", &[]).await?;
            }
            SliceState::AskingSupports => {
                self.ctx.present(CONTENT, "asking_supports", &[]).await?;
            }
            SliceState::Confirming => {
                let p = self.parameters();
                let layer = format!("{:.2}", p.layer_height_mm);
                let infill = p.infill_percent.to_string();
                let supports = if p.supports { "yes" } else { "no" };
                self.ctx
                    .present(
                        CONTENT,
                        "confirming",
                        &[
                            ("layer", layer.as_str()),
                            ("infill", infill.as_str()),
                            ("supports", supports),
                        ],
                    )
                    .await?;
            }
            SliceState::Submitting => {
                return Ok(Some(match self.submit().await {
                    Ok(()) => SliceTrigger::Submitted,
                    Err(e) => {
                        tracing::warn!(session_id = %self.ctx.session_id, "job submission failed: {}", e);
                        self.failure = Some(e.to_string());
                        SliceTrigger::SubmitFailed
                    }
                }));
            }
            SliceState::Slicing => {
                let text = self.progress_text(INDICATOR_FRAMES[0])?;
                self.ticks = 0;
                match self.ctx.say(&text).await {
                    Ok(id) => {
                        self.progress_message = Some(id);
                        self.spawn_ticker();
                    }
                    Err(e) => tracing::warn!(
                        session_id = %self.ctx.session_id,
                        "progress message not delivered: {}",
                        e
                    ),
                }
            }
            SliceState::Done => {
                let done = self
                    .completion
                    .clone()
                    .ok_or_else(|| DialogError::invariant("slicing finished without a result"))?;
                let duration = done.duration_secs.to_string();
                let filament = format!("{:.1}", done.filament_grams);
                let link = done.artifact_link.clone();
                self.ctx
                    .raise(DialogOutcome::Completed(DialogResult::Sliced(done)))?;
                self.ctx
                    .present_closing(
                        CONTENT,
                        "done",
                        &[
                            ("duration", duration.as_str()),
                            ("filament", filament.as_str()),
                            ("link", link.as_str()),
                        ],
                    )
                    .await;
            }
            SliceState::Failed => {
                self.stop_ticker();
                let reason = self
                    .failure
                    .clone()
                    .unwrap_or_else(|| "slicing failed".to_string());
                self.ctx.raise(DialogOutcome::Failed(reason))?;
            }
            SliceState::Canceled => {
                self.stop_ticker();
                self.ctx.raise(DialogOutcome::Canceled)?;
                self.ctx.present_closing(CONTENT, "canceled", &[]).await;
            }
            SliceState::Init => {}
        }
        Ok(None)
    }
}

/// 切片对话
pub struct SlicingDialog {
    machine: StateMachine<SliceState>,
    table: TransitionTable<SliceState, SliceTrigger, SliceData>,
    data: SliceData,
}

impl SlicingDialog {
    pub fn new(ctx: DialogContext, model_path: String) -> Self {
        Self {
            machine: StateMachine::new("slicing", SliceState::Init),
            table: table(),
            data: SliceData {
                ctx,
                model_path,
                layer_height: None,
                infill: None,
                supports: None,
                job_id: None,
                progress_message: None,
                ticks: 0,
                ticker: None,
                completion: None,
                failure: None,
            },
        }
    }

    pub fn state(&self) -> SliceState {
        self.machine.state()
    }

    pub fn progress_message(&self) -> Option<MessageId> {
        self.data.progress_message
    }

    pub fn job_id(&self) -> Option<&str> {
        self.data.job_id.as_deref()
    }

    async fn fire(&mut self, trigger: SliceTrigger) -> Result<(), DialogError> {
        let outcome = self.machine.fire(&self.table, &mut self.data, trigger).await;
        settle(outcome, &format!("{:?}", trigger))
    }

    /// 定时器 tick：原地刷新进度消息，编辑失败只记日志
    async fn on_tick(&mut self) -> Result<(), DialogError> {
        let Some(message_id) = self.data.progress_message else {
            return Ok(());
        };
        self.data.ticks += 1;
        let frame = INDICATOR_FRAMES[self.data.ticks % INDICATOR_FRAMES.len()];
        let text = self.data.progress_text(frame)?;
        if let Err(e) = self
            .data
            .ctx
            .collab
            .transport
            .edit_text(&self.data.ctx.session_id, message_id, &text)
            .await
        {
            tracing::warn!(
                session_id = %self.data.ctx.session_id,
                tick = self.data.ticks,
                "progress edit not delivered: {}",
                e
            );
        }
        Ok(())
    }

    fn quality_from(event: &Event) -> Option<f32> {
        match event {
            Event::Callback(data) => data.strip_prefix("quality:").and_then(layer_height_for),
            Event::Text { intent: Intent::SetParameter { name, value }, .. } if name == "quality" => {
                layer_height_for(value)
            }
            Event::Text { text, .. } => layer_height_for(text),
            _ => None,
        }
    }
}

#[async_trait]
impl SubDialog for SlicingDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::Slicing
    }

    fn instance(&self) -> DialogInstanceId {
        self.data.ctx.instance
    }

    fn context_policy(&self) -> ContextPolicy {
        ContextPolicy::SingleReplace
    }

    async fn start(&mut self) -> Result<(), DialogError> {
        self.fire(SliceTrigger::Begin).await
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), DialogError> {
        let state = self.machine.state();

        match event {
            Event::TimerTick => {
                if state == SliceState::Slicing {
                    return self.on_tick().await;
                }
                tracing::debug!(session_id = %self.data.ctx.session_id, state = ?state, "tick ignored");
                return Ok(());
            }
            Event::AsyncCompletion(result) => {
                if state != SliceState::Slicing {
                    tracing::warn!(
                        session_id = %self.data.ctx.session_id,
                        state = ?state,
                        "job completion outside of slicing, discarded"
                    );
                    return Ok(());
                }
                return match result {
                    Ok(done) => {
                        self.data.completion = Some(done);
                        self.fire(SliceTrigger::JobDone).await
                    }
                    Err(e) => {
                        self.data.failure = Some(e.to_string());
                        self.fire(SliceTrigger::JobFailed).await
                    }
                };
            }
            _ => {}
        }

        if event.is_cancel() {
            return self.fire(SliceTrigger::Cancel).await;
        }

        match state {
            SliceState::AskingQuality => {
                let layer = Self::quality_from(&event)
                    .ok_or_else(|| DialogError::user_input("expected fine, normal or draft"))?;
                self.data.layer_height = Some(layer);
                self.fire(SliceTrigger::QualityChosen).await
            }
            SliceState::AskingInfill => {
                // 质量选择重发一次：上一条提问没送达时用户会再点一次
                if let Some(layer) = Self::quality_from(&event) {
                    self.data.layer_height = Some(layer);
                    return self.fire(SliceTrigger::QualityChosen).await;
                }
                let raw = match &event {
                    Event::Text {
                        intent: Intent::SetParameter { name, value },
                        ..
                    } if name == "infill" => value.clone(),
                    _ => event_text(&event)
                        .map(|t| t.to_string())
                        .ok_or_else(|| DialogError::user_input("expected an infill percentage"))?,
                };
                self.data.infill = Some(parse_infill(&raw)?);
                self.fire(SliceTrigger::InfillGiven).await
            }
            SliceState::AskingSupports => {
                if event.is_affirm() {
                    self.data.supports = Some(true);
                } else if event.is_deny() {
                    self.data.supports = Some(false);
                } else if let Some(infill) = event_text(&event).and_then(|t| parse_infill(t).ok()) {
                    self.data.infill = Some(infill);
                    return self.fire(SliceTrigger::InfillGiven).await;
                } else {
                    return Err(DialogError::user_input("expected yes or no"));
                }
                self.fire(SliceTrigger::SupportsChosen).await
            }
            SliceState::Confirming => {
                if event.is_affirm() {
                    self.fire(SliceTrigger::Confirm).await
                } else if event.is_deny() {
                    self.fire(SliceTrigger::Revise).await
                } else {
                    Err(DialogError::user_input("expected yes or no"))
                }
            }
            SliceState::Slicing => Err(DialogError::user_input("slicing is still running")),
            other => Err(DialogError::invariant(format!(
                "slicing received input in {:?}",
                other
            ))),
        }
    }

    fn teardown(&mut self) {
        self.data.stop_ticker();
    }
}
