//! Mock 协作者（用于测试与控制台宿主，无需外部服务）
//!
//! - `ScriptedClassifier`：按脚本依次返回分类结果，并记录调用
//! - `KeywordClassifier`：关键词规则分类，控制台演示用
//! - `RecordingTransport`：记录所有发出的消息 / 编辑 / 媒体
//! - `StdoutTransport`：打印到标准输出
//! - `ManualJobService`：由测试手动完成任务
//! - `SimulatedJobService`：固定延迟后自动完成

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::oneshot;

use super::{
    ClassificationResult, Classifier, CollabError, JobCompletion, JobService, JobSubscription,
    Keyboard, MessageId, SliceParameters, Transport,
};

/// 一次分类调用的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierCall {
    pub session_id: String,
    pub text: String,
    pub contexts: Vec<String>,
    pub reset_contexts: bool,
}

/// 按脚本返回结果；脚本耗尽后返回 `fallback` 意图
#[derive(Debug, Default)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<ClassificationResult, CollabError>>>,
    calls: Mutex<Vec<ClassifierCall>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: ClassificationResult) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(result));
        }
    }

    pub fn push_error(&self, error: CollabError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
    }

    pub fn calls(&self) -> Vec<ClassifierCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        session_id: &str,
        text: &str,
        contexts: &[String],
        reset_contexts: bool,
    ) -> Result<ClassificationResult, CollabError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ClassifierCall {
                session_id: session_id.to_string(),
                text: text.to_string(),
                contexts: contexts.to_vec(),
                reset_contexts,
            });
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Ok(ClassificationResult::new("fallback")))
    }
}

/// 关键词规则分类器
pub struct KeywordClassifier {
    search: Regex,
    print: Regex,
    number: Regex,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self {
            search: Regex::new(r"^(?:search|find)\s+(?:for\s+)?(.+)$").expect("static regex"),
            print: Regex::new(r"print\s+(?:an?\s+|the\s+)?(.+)$").expect("static regex"),
            number: Regex::new(r"^(\d{1,3})\s*%?$").expect("static regex"),
        }
    }

    fn match_text(&self, input: &str) -> ClassificationResult {
        let lower = input.trim().to_lowercase();

        if let Some(caps) = self.search.captures(&lower) {
            return ClassificationResult::new("search_model").with_param("term", caps[1].trim());
        }
        if let Some(caps) = self.number.captures(&lower) {
            let n: u64 = caps[1].parse().unwrap_or(0);
            return ClassificationResult::new("select_option").with_param("index", n);
        }

        let word = |words: &[&str]| words.iter().any(|w| lower == *w || lower.starts_with(&format!("{} ", w)));

        if word(&["yes", "yeah", "yep", "ok", "sure", "ja"]) {
            return ClassificationResult::new("affirm");
        }
        if word(&["no", "nope", "nein"]) {
            return ClassificationResult::new("deny");
        }
        if word(&["cancel", "stop", "abort", "quit", "bye"]) {
            return ClassificationResult::new("cancel");
        }
        if word(&["hello", "hi", "hallo", "hey"]) {
            return ClassificationResult::new("greeting");
        }
        if word(&["help"]) {
            return ClassificationResult::new("help");
        }
        if word(&["next", "more"]) {
            return ClassificationResult::new("next_page");
        }
        if lower.contains("slice") {
            return ClassificationResult::new("start_slicing");
        }
        if lower.contains("checklist") {
            return ClassificationResult::new("start_checklist");
        }
        if lower.contains("tour") || lower.contains("hardware") {
            return ClassificationResult::new("hardware_tutorial");
        }
        if lower.contains("how") || lower.contains("workflow") {
            return ClassificationResult::new("workflow_tutorial");
        }
        if let Some(caps) = self.print.captures(&lower) {
            return ClassificationResult::new("describe_object")
                .with_param("description", caps[1].trim());
        }

        ClassificationResult::new("fallback")
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(
        &self,
        _session_id: &str,
        text: &str,
        _contexts: &[String],
        _reset_contexts: bool,
    ) -> Result<ClassificationResult, CollabError> {
        Ok(self.match_text(text))
    }
}

/// 发出的一条消息
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text {
        id: MessageId,
        text: String,
        keyboard: Option<Keyboard>,
    },
    Edit {
        id: MessageId,
        text: String,
    },
    Media {
        media: Vec<String>,
        caption: Option<String>,
    },
}

/// 记录型通道：测试断言用
#[derive(Debug, Default)]
pub struct RecordingTransport {
    log: Mutex<Vec<(String, Outbound)>>,
    next_id: AtomicU64,
    failing: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后所有调用都返回 DeliveryFailed
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 每次 send_text 前等待（模拟慢速入口动作）
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        if let Ok(mut d) = self.send_delay.lock() {
            *d = delay;
        }
    }

    pub fn outbound(&self) -> Vec<Outbound> {
        self.log
            .lock()
            .map(|l| l.iter().map(|(_, o)| o.clone()).collect())
            .unwrap_or_default()
    }

    pub fn outbound_for(&self, session_id: &str) -> Vec<Outbound> {
        self.log
            .lock()
            .map(|l| {
                l.iter()
                    .filter(|(s, _)| s == session_id)
                    .map(|(_, o)| o.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 所有新发文本
    pub fn texts(&self) -> Vec<String> {
        self.outbound()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// 所有编辑 (message_id, text)
    pub fn edits(&self) -> Vec<(MessageId, String)> {
        self.outbound()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Edit { id, text } => Some((id, text)),
                _ => None,
            })
            .collect()
    }

    pub fn last_text(&self) -> Option<String> {
        self.texts().pop()
    }

    pub fn clear(&self) {
        if let Ok(mut l) = self.log.lock() {
            l.clear();
        }
    }

    fn check(&self) -> Result<(), CollabError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CollabError::DeliveryFailed("transport offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn record(&self, session_id: &str, out: Outbound) {
        if let Ok(mut l) = self.log.lock() {
            l.push((session_id.to_string(), out));
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(
        &self,
        session_id: &str,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageId, CollabError> {
        let delay = self.send_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(
            session_id,
            Outbound::Text {
                id,
                text: text.to_string(),
                keyboard: keyboard.cloned(),
            },
        );
        Ok(id)
    }

    async fn edit_text(
        &self,
        session_id: &str,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), CollabError> {
        self.check()?;
        self.record(
            session_id,
            Outbound::Edit {
                id: message_id,
                text: text.to_string(),
            },
        );
        Ok(())
    }

    async fn send_media(
        &self,
        session_id: &str,
        media: &[String],
        caption: Option<&str>,
    ) -> Result<(), CollabError> {
        self.check()?;
        self.record(
            session_id,
            Outbound::Media {
                media: media.to_vec(),
                caption: caption.map(|c| c.to_string()),
            },
        );
        Ok(())
    }
}

/// 控制台通道：打印到 stdout
#[derive(Debug, Default)]
pub struct StdoutTransport {
    next_id: AtomicU64,
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn send_text(
        &self,
        _session_id: &str,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageId, CollabError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        println!("bot> {}", text);
        if let Some(kb) = keyboard {
            for row in &kb.rows {
                let buttons: Vec<String> = row
                    .iter()
                    .map(|b| format!("[{} -> /tap {}]", b.label, b.data))
                    .collect();
                println!("     {}", buttons.join(" "));
            }
        }
        Ok(id)
    }

    async fn edit_text(
        &self,
        _session_id: &str,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), CollabError> {
        println!("bot> (edit #{}) {}", message_id, text);
        Ok(())
    }

    async fn send_media(
        &self,
        _session_id: &str,
        media: &[String],
        caption: Option<&str>,
    ) -> Result<(), CollabError> {
        println!("bot> [media: {}] {}", media.join(", "), caption.unwrap_or(""));
        Ok(())
    }
}

type PendingJob = (
    String,
    oneshot::Sender<Result<JobCompletion, CollabError>>,
);

/// 手动完成的任务服务
#[derive(Debug, Default)]
pub struct ManualJobService {
    pending: Mutex<VecDeque<PendingJob>>,
    submitted: Mutex<Vec<SliceParameters>>,
    fail_submissions: AtomicBool,
    next_id: AtomicU64,
}

impl ManualJobService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<SliceParameters> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// 完成最早提交的任务；返回是否有任务被完成（接收端已关闭也算完成）
    pub fn complete_next(&self, result: Result<JobCompletion, CollabError>) -> bool {
        let next = self.pending.lock().ok().and_then(|mut p| p.pop_front());
        match next {
            Some((_, tx)) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobService for ManualJobService {
    async fn submit(&self, params: &SliceParameters) -> Result<JobSubscription, CollabError> {
        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(CollabError::SubmissionFailed("slicer unavailable".to_string()));
        }
        let job_id = format!("job_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut s) = self.submitted.lock() {
            s.push(params.clone());
        }
        if let Ok(mut p) = self.pending.lock() {
            p.push_back((job_id.clone(), tx));
        }
        Ok(JobSubscription {
            job_id,
            completion: rx,
        })
    }
}

/// 固定延迟后自动完成的任务服务（控制台演示）
#[derive(Debug, Clone)]
pub struct SimulatedJobService {
    delay: Duration,
}

impl SimulatedJobService {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl JobService for SimulatedJobService {
    async fn submit(&self, params: &SliceParameters) -> Result<JobSubscription, CollabError> {
        let job_id = format!("sim_{}", uuid::Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        let delay = self.delay;
        let link = format!("file://{}.gcode", params.model_path);
        let grams = 12.5 + f64::from(params.infill_percent) * 0.3;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Ok(JobCompletion {
                artifact_link: link,
                duration_secs: delay.as_secs().max(1),
                filament_grams: grams,
            }));
        });
        Ok(JobSubscription {
            job_id,
            completion: rx,
        })
    }
}
