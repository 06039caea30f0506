//! 切片任务集成测试：进度消息原地刷新、完成摘要只发一次、迟到的回调被丢弃

use std::sync::Arc;
use std::time::Duration;

use printguide::collab::mock::{ManualJobService, Outbound, RecordingTransport, ScriptedClassifier};
use printguide::collab::{
    AttachmentRef, CatalogSearchService, CollabError, Collaborators, DirectoryAttachmentStore,
    JobCompletion, StaticContentStore,
};
use printguide::config::DialogSection;
use printguide::core::{Orchestrator, OrchestratorDeps, OrchestratorState};
use printguide::dialogs::DialogKind;
use printguide::gateway::SessionRegistry;
use printguide::router::{IntentTable, RawEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Setup {
    deps: OrchestratorDeps,
    transport: Arc<RecordingTransport>,
    jobs: Arc<ManualJobService>,
    model: AttachmentRef,
    _dir: tempfile::TempDir,
}

fn setup(tick_interval_ms: u64) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("bracket.stl");
    std::fs::write(&model_path, b"solid bracket\nendsolid bracket\n").unwrap();

    let transport = Arc::new(RecordingTransport::new());
    let jobs = Arc::new(ManualJobService::new());
    let settings = DialogSection {
        tick_interval_ms,
        checklist: vec!["bed_clean".into()],
        ..DialogSection::default()
    };
    let collab = Collaborators {
        classifier: Arc::new(ScriptedClassifier::new()),
        transport: transport.clone(),
        attachments: Arc::new(DirectoryAttachmentStore::new(
            dir.path().join("store"),
            settings.max_attachment_bytes,
        )),
        jobs: jobs.clone(),
        search: Arc::new(CatalogSearchService::with_demo_catalog()),
        content: Arc::new(StaticContentStore::with_defaults().unwrap()),
    };
    Setup {
        deps: OrchestratorDeps::new(collab, settings, IntentTable::default()),
        transport,
        jobs,
        model: AttachmentRef {
            name: "bracket.stl".to_string(),
            size_bytes: 2_048,
            file_ref: model_path.to_string_lossy().to_string(),
        },
        _dir: dir,
    }
}

fn completion() -> JobCompletion {
    JobCompletion {
        artifact_link: "https://files.example.org/bracket.gcode".to_string(),
        duration_secs: 42,
        filament_grams: 7.25,
    }
}

/// 问候 → 上传 → 确认切片 → 选参数 → 提交
fn script(model: &AttachmentRef) -> Vec<RawEvent> {
    vec![
        RawEvent::Text("Hallo".into()),
        RawEvent::Text("Max".into()),
        RawEvent::Attachment(model.clone()),
        RawEvent::Callback("yes".into()),
        RawEvent::Callback("quality:normal".into()),
        RawEvent::Text("30".into()),
        RawEvent::Callback("no".into()),
        RawEvent::Callback("yes".into()),
    ]
}

async fn slicing_orchestrator(s: &Setup) -> (Orchestrator, mpsc::UnboundedReceiver<RawEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut orch = Orchestrator::new("chat-1", &s.deps, tx, CancellationToken::new());
    for event in script(&s.model) {
        orch.handle(event).await;
    }
    assert_eq!(orch.state(), OrchestratorState::Slicing);
    assert_eq!(s.jobs.pending_count(), 1);
    (orch, rx)
}

fn progress_id(transport: &RecordingTransport) -> u64 {
    transport
        .outbound()
        .iter()
        .rev()
        .find_map(|o| match o {
            Outbound::Text { id, text, .. } if text.starts_with("Slicing your model") => Some(*id),
            _ => None,
        })
        .unwrap()
}

#[tokio::test]
async fn test_parameters_reach_job_service() {
    let s = setup(60_000);
    let (_orch, _rx) = slicing_orchestrator(&s).await;

    let submitted = s.jobs.submitted();
    assert_eq!(submitted.len(), 1);
    assert!((submitted[0].layer_height_mm - 0.2).abs() < f32::EPSILON);
    assert_eq!(submitted[0].infill_percent, 30);
    assert!(!submitted[0].supports);
    assert!(submitted[0].model_path.ends_with("bracket.stl"));
}

#[tokio::test]
async fn test_ticks_edit_one_message_and_summary_is_sent_once() {
    let s = setup(60_000);
    let (mut orch, mut rx) = slicing_orchestrator(&s).await;
    let instance = orch.active_instance().unwrap();
    let message_id = progress_id(&s.transport);
    let texts_before = s.transport.texts().len();

    for _ in 0..3 {
        orch.handle(RawEvent::TimerTick { instance }).await;
    }

    let edits = s.transport.edits();
    assert_eq!(edits.len(), 3);
    assert!(edits.iter().all(|(id, _)| *id == message_id));
    assert_eq!(s.transport.texts().len(), texts_before);

    assert!(s.jobs.complete_next(Ok(completion())));
    let finished = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(finished, RawEvent::JobFinished { .. }));
    orch.handle(finished).await;

    assert_eq!(orch.state(), OrchestratorState::Checklist);
    assert_eq!(orch.active_dialog(), Some(DialogKind::Checklist));
    let summaries: Vec<String> = s
        .transport
        .texts()
        .into_iter()
        .filter(|t| t.starts_with("Slicing finished"))
        .collect();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].contains("42 s"));
    assert!(summaries[0].contains("bracket.gcode"));
    assert_eq!(
        orch.session().last_slice.as_ref().map(|c| c.duration_secs),
        Some(42)
    );

    // 迟到的 tick 属于已结束的实例：不编辑、不发消息、不改状态
    let outbound_before = s.transport.outbound().len();
    orch.handle(RawEvent::TimerTick { instance }).await;
    orch.handle(RawEvent::JobFinished {
        instance,
        result: Ok(completion()),
    })
    .await;
    assert_eq!(s.transport.outbound().len(), outbound_before);
    assert_eq!(orch.state(), OrchestratorState::Checklist);
}

#[tokio::test]
async fn test_transport_outage_during_slicing_sends_no_apologies() {
    let s = setup(60_000);
    let (mut orch, mut rx) = slicing_orchestrator(&s).await;
    let instance = orch.active_instance().unwrap();
    let texts_before = s.transport.texts().len();

    s.transport.set_failing(true);
    for _ in 0..5 {
        orch.handle(RawEvent::TimerTick { instance }).await;
    }
    s.transport.set_failing(false);
    orch.handle(RawEvent::TimerTick { instance }).await;

    assert_eq!(orch.state(), OrchestratorState::Slicing);
    assert_eq!(s.transport.texts().len(), texts_before);
    assert_eq!(s.transport.edits().len(), 1);

    // 摘要没送达，结果照样交回编排器；检查清单也发不出去，于是回到菜单
    s.transport.set_failing(true);
    assert!(s.jobs.complete_next(Ok(completion())));
    let finished = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    orch.handle(finished).await;
    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert!(orch.active_dialog().is_none());
    assert_eq!(
        orch.session().last_slice.as_ref().map(|c| c.duration_secs),
        Some(42)
    );
}

#[tokio::test]
async fn test_cancel_during_slicing_discards_late_completion() {
    let s = setup(60_000);
    let (mut orch, mut rx) = slicing_orchestrator(&s).await;
    let instance = orch.active_instance().unwrap();

    orch.handle(RawEvent::Callback("cancel".into())).await;
    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert!(orch.active_instance().is_none());
    assert!(s.transport.texts().iter().any(|t| t == "Slicing canceled."));

    let outbound_before = s.transport.outbound().len();
    s.jobs.complete_next(Ok(completion()));
    if let Ok(Some(late)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        orch.handle(late).await;
    }
    orch.handle(RawEvent::TimerTick { instance }).await;

    assert_eq!(s.transport.outbound().len(), outbound_before);
    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert!(orch.session().last_slice.is_none());
}

#[tokio::test]
async fn test_failed_job_apologises_and_returns_to_menu() {
    let s = setup(60_000);
    let (mut orch, mut rx) = slicing_orchestrator(&s).await;

    s.jobs
        .complete_next(Err(CollabError::SubmissionFailed("slicer crashed at layer 12".into())));
    let finished = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    orch.handle(finished).await;

    assert_eq!(orch.state(), OrchestratorState::Idle);
    let texts = s.transport.texts();
    assert!(texts.iter().any(|t| t.starts_with("Sorry, that didn't work out")));
    assert!(texts.iter().all(|t| !t.contains("layer 12")));
}

#[tokio::test]
async fn test_submission_failure_returns_to_menu() {
    let s = setup(60_000);
    s.jobs.set_fail_submissions(true);
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut orch = Orchestrator::new("chat-1", &s.deps, tx, CancellationToken::new());

    for event in script(&s.model) {
        orch.handle(event).await;
    }

    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert_eq!(s.jobs.pending_count(), 0);
    assert!(s
        .transport
        .texts()
        .iter()
        .any(|t| t.starts_with("Sorry, that didn't work out")));
}

#[tokio::test]
async fn test_real_ticker_through_registry() {
    let s = setup(10);
    let registry = SessionRegistry::new(s.deps.clone());
    for event in script(&s.model) {
        registry.dispatch("chat-1", event).unwrap();
    }

    let mut rx = registry.subscribe("chat-1").unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|snap| snap.state == OrchestratorState::Slicing),
    )
    .await
    .unwrap()
    .unwrap();

    // 等几次 tick
    tokio::time::timeout(Duration::from_secs(5), async {
        while s.transport.edits().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(s.jobs.complete_next(Ok(completion())));
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|snap| snap.state == OrchestratorState::Checklist),
    )
    .await
    .unwrap()
    .unwrap();

    let message_id = progress_id(&s.transport);
    assert!(s
        .transport
        .edits()
        .iter()
        .all(|(id, _)| *id == message_id));

    // 定时器已停：一段时间后编辑数不再增长
    tokio::time::sleep(Duration::from_millis(30)).await;
    let settled = s.transport.edits().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(s.transport.edits().len(), settled);

    let summaries = s
        .transport
        .texts()
        .into_iter()
        .filter(|t| t.starts_with("Slicing finished"))
        .count();
    assert_eq!(summaries, 1);
    registry.shutdown();
}
