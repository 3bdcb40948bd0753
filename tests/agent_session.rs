//! End-to-end live-run scenarios against the supervisor, with a
//! scripted browser transport and a scripted model.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use webpilot::auth::StaticTokenVerifier;
use webpilot::browser::{Browser, ScriptedTransport};
use webpilot::config::{AppConfig, BrowserLaunchConfig};
use webpilot::errors::BrowserError;
use webpilot::llm::{FunctionCall, ModelReply, ScriptedModel};
use webpilot::server::connection::{ClientConnection, Outbound};
use webpilot::server::supervisor::{BrowserFactory, Supervisor};
use webpilot::storage::{MemoryStore, RunStore};
use webpilot::types::{Run, RunStatus};

fn scripted_handler() -> Box<dyn Fn(&str, &Value) -> Result<Value, BrowserError> + Send + Sync> {
    Box::new(|method, params| match method {
        "Page.captureScreenshot" => Ok(json!({ "data": "cGFnZQ==" })),
        "Runtime.evaluate" => {
            let expr = params["expression"].as_str().unwrap_or_default();
            if expr.contains("readyState") {
                Ok(json!({ "result": { "value": "complete" } }))
            } else if expr.contains("recaptcha/enterprise/anchor") {
                Ok(json!({ "result": { "value": "{\"kind\":null}" } }))
            } else if expr.contains("highlighted") || expr.contains("cleared") {
                Ok(json!({ "result": { "value":
                    "{\"highlighted\":1,\"labeled\":0,\"cleared\":1,\"badges\":0}" } }))
            } else if expr.contains("isVisible") {
                Ok(json!({ "result": { "value": "{\"found\":true,\"x\":8.0,\"y\":8.0}" } }))
            } else {
                Ok(json!({ "result": { "value": "" } }))
            }
        }
        _ => Ok(json!({})),
    })
}

fn scripted_factory() -> BrowserFactory {
    Arc::new(|| {
        Box::pin(async {
            Ok(Browser::new(
                Arc::new(ScriptedTransport::new(scripted_handler())),
                BrowserLaunchConfig {
                    settle_ms: 0,
                    ..BrowserLaunchConfig::default()
                },
            ))
        })
    })
}

struct TestSession {
    supervisor: Arc<Supervisor>,
    store: Arc<MemoryStore>,
    connection: Arc<ClientConnection>,
    control_rx: mpsc::UnboundedReceiver<Outbound>,
}

async fn session(replies: Vec<ModelReply>) -> TestSession {
    let store = Arc::new(MemoryStore::new());
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(StaticTokenVerifier::new("token", "user-a")),
        store.clone(),
        store.clone(),
        Arc::new(ScriptedModel::new(replies)),
        AppConfig::default(),
        scripted_factory(),
    ));
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let (frame_tx, _frame_rx) = mpsc::channel(8);
    let connection = Arc::new(ClientConnection::new("it-conn".into(), control_tx, frame_tx));
    supervisor.authenticate(&connection, "token").await;
    let _ = control_rx.recv().await; // authentication frame

    TestSession {
        supervisor,
        store,
        connection,
        control_rx,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(Outbound::Text(payload)) = rx.try_recv() {
        events.push(serde_json::from_str(&payload).unwrap());
    }
    events
}

#[tokio::test]
async fn objective_run_records_trace_and_answer() {
    let mut s = session(vec![
        ModelReply {
            text: "Opening the page".into(),
            call: Some(FunctionCall {
                name: "handle_url".into(),
                args: json!({
                    "url": "https://example.com",
                    "action": "navigate",
                    "explanation": "Open example.com to read the heading",
                }),
            }),
        },
        ModelReply {
            text: "The heading reads Example Domain".into(),
            call: None,
        },
    ])
    .await;
    s.store
        .insert_run(Run::new("run-1", "user-a", "Go to example.com and report the heading"));

    s.supervisor
        .clone()
        .run_live(
            s.connection.clone(),
            "run-1".into(),
            CancellationToken::new(),
        )
        .await;

    let run = s.store.fetch_run("user-a", "run-1").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.final_answer.as_deref(),
        Some("The heading reads Example Domain")
    );
    assert_eq!(run.trace.len(), 1);
    assert_eq!(
        serde_json::to_value(&run.trace[0]).unwrap()["type"],
        "navigate"
    );
    assert!(!run.steps.is_empty());

    let events = drain(&mut s.control_rx);
    let completions: Vec<&Value> = events
        .iter()
        .filter(|event| event["type"] == "completion")
        .collect();
    assert_eq!(completions.len(), 1, "exactly one completion per run");
    assert_eq!(completions[0]["status"], "completed");
}

#[tokio::test]
async fn step_updates_are_monotonic() {
    let scroll = |label: &str| ModelReply {
        text: format!("scrolling {label}"),
        call: Some(FunctionCall {
            name: "handle_scroll".into(),
            args: json!({ "action": "scroll", "explanation": label }),
        }),
    };
    let mut s = session(vec![
        scroll("first"),
        scroll("second"),
        scroll("third"),
        ModelReply {
            text: "all done".into(),
            call: None,
        },
    ])
    .await;
    s.store.insert_run(Run::new("run-2", "user-a", "scroll around"));

    s.supervisor
        .clone()
        .run_live(
            s.connection.clone(),
            "run-2".into(),
            CancellationToken::new(),
        )
        .await;

    let numbers: Vec<u64> = drain(&mut s.control_rx)
        .into_iter()
        .filter(|event| event["type"] == "step_update")
        .map(|event| event["step"]["number"].as_u64().unwrap())
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn looping_model_hits_the_step_cap() {
    let replies: Vec<ModelReply> = (0..40)
        .map(|i| ModelReply {
            text: format!("still scrolling {i}"),
            call: Some(FunctionCall {
                name: "handle_scroll".into(),
                args: json!({ "action": "scroll", "explanation": "looking" }),
            }),
        })
        .collect();
    let mut s = session(replies).await;
    s.store.insert_run(Run::new("run-3", "user-a", "never finishes"));

    s.supervisor
        .clone()
        .run_live(
            s.connection.clone(),
            "run-3".into(),
            CancellationToken::new(),
        )
        .await;

    let run = s.store.fetch_run("user-a", "run-3").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.steps.len(), 25, "hard cap at 25 iterations");

    let events = drain(&mut s.control_rx);
    let completion = events
        .iter()
        .find(|event| event["type"] == "completion")
        .unwrap();
    assert_eq!(completion["status"], "failed");
    assert_eq!(completion["message"], "max steps");
}

#[tokio::test]
async fn terminal_run_cannot_be_restarted() {
    let mut s = session(vec![ModelReply {
        text: "immediate answer".into(),
        call: None,
    }])
    .await;
    s.store.insert_run(Run::new("run-4", "user-a", "trivial"));

    s.supervisor
        .clone()
        .run_live(
            s.connection.clone(),
            "run-4".into(),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(
        s.store.fetch_run("user-a", "run-4").await.unwrap().status,
        RunStatus::Completed
    );

    // A second dispatch serves the persisted record and asks to close.
    let close = s
        .supervisor
        .clone()
        .run_live(
            s.connection.clone(),
            "run-4".into(),
            CancellationToken::new(),
        )
        .await;
    assert!(close);

    let events = drain(&mut s.control_rx);
    let completions = events
        .iter()
        .filter(|event| event["type"] == "completion")
        .count();
    assert_eq!(completions, 2);
    // The record still holds the first result.
    assert_eq!(
        s.store
            .fetch_run("user-a", "run-4")
            .await
            .unwrap()
            .final_answer
            .as_deref(),
        Some("immediate answer")
    );
}
