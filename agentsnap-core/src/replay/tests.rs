//! Integration tests for generate and replay

use crate::agent::{FnTool, LoopAgent, RunMode, SnapshotAgent};
use crate::config::SnapshotConfig;
use crate::error::{Result, SnapshotError};
use crate::events::AgentEvent;
use crate::llm::{LlmResponse, ScriptedLlmClient};
use crate::record::RecordedResponse;
use crate::session::SnapshotMode;
use crate::snapshot::{AgentSnapshot, ReplayOverrides, RunOptions};
use crate::store::{FsSnapshotStore, InMemorySnapshotStore, SnapshotStore};
use crate::verify::VerificationOverrides;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PROMPT: &str = "What is the weather in Paris?";
const ANSWER: &str = "It is sunny in Paris.";

fn weather_agent(responses: Vec<LlmResponse>, max_loops: usize) -> Arc<LoopAgent> {
    let lookup = FnTool::new("lookup", "Looks up the weather", |args: Value| -> Result<Value> {
        Ok(json!({"city": args["city"], "sky": "clear"}))
    });
    Arc::new(
        LoopAgent::builder()
            .name("weather")
            .system_prompt("You answer weather questions.")
            .max_loops(max_loops)
            .tool(lookup)
            .llm_client(Arc::new(ScriptedLlmClient::new(responses)))
            .build()
            .unwrap(),
    )
}

fn paris_script() -> Vec<LlmResponse> {
    vec![
        LlmResponse::tool_call("lookup", json!({"city": "Paris"})),
        LlmResponse::text(ANSWER),
    ]
}

fn memory_snapshot(
    agent: Arc<LoopAgent>,
    store: &Arc<InMemorySnapshotStore>,
) -> AgentSnapshot<LoopAgent> {
    AgentSnapshot::with_store(
        agent,
        SnapshotConfig::default().with_case_name("weather"),
        Arc::clone(store) as Arc<dyn SnapshotStore>,
    )
    .unwrap()
}

/// Overwrite the request of a stored loop
fn edit_request(store: &InMemorySnapshotStore, loop_index: usize, edit: impl FnOnce(&mut Value)) {
    let mut record = store.read("weather", loop_index).unwrap();
    edit(&mut record.request);
    store.write("weather", &record).unwrap();
}

#[tokio::test]
async fn test_round_trip_blocking_on_disk() {
    let dir = TempDir::new().unwrap();
    let config = SnapshotConfig::new(dir.path(), "weather_paris");

    let recorder = AgentSnapshot::new(weather_agent(paris_script(), 5), config.clone()).unwrap();
    let generated = recorder.generate(PROMPT).await.unwrap();
    assert_eq!(generated.response, ANSWER);
    assert_eq!(generated.loop_count, 2);
    assert_eq!(generated.meta.mode, SnapshotMode::Generate);

    let case_dir = dir.path().join("weather_paris");
    assert!(case_dir.join("case.json").is_file());
    for file in ["request.json", "response.json", "events.json", "tool_calls.json"] {
        assert!(case_dir.join("loop-0").join(file).is_file(), "missing {}", file);
    }

    // A fresh agent whose own client would fail if it were ever called
    let replayer = AgentSnapshot::new(weather_agent(Vec::new(), 5), config).unwrap();
    let replayed = replayer.replay(PROMPT, None).await.unwrap();
    assert_eq!(replayed.response, generated.response);
    assert_eq!(replayed.loop_count, 2);
    assert_eq!(replayed.meta.mode, SnapshotMode::Replay);
    assert!(!replayed.meta.updated);
    assert_eq!(replayer.current_loop(), 2);
}

#[tokio::test]
async fn test_round_trip_streaming() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let recorder = memory_snapshot(weather_agent(paris_script(), 5), &store);
    let generated = recorder
        .generate(RunOptions::streaming(PROMPT))
        .await
        .unwrap();
    assert!(store.read("weather", 1).unwrap().response.is_stream());

    let replayer = memory_snapshot(weather_agent(Vec::new(), 5), &store);
    let replayed = replayer
        .replay(RunOptions::streaming(PROMPT), None)
        .await
        .unwrap();
    assert_eq!(replayed.response, ANSWER);

    let chunks = |events: &[crate::events::EventEnvelope]| -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match &e.event {
                AgentEvent::StreamChunk { chunk, .. } => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    };
    assert_eq!(chunks(&replayed.events), chunks(&generated.events));
    assert_eq!(chunks(&replayed.events).concat(), ANSWER);
}

#[tokio::test]
async fn test_round_trip_with_line_broken_timestamp() {
    let prompt = "Weather in Paris at 2026-03-01\n10:00:00Z please";
    let store = Arc::new(InMemorySnapshotStore::new());
    let recorder = memory_snapshot(weather_agent(paris_script(), 5), &store);
    recorder.generate(prompt).await.unwrap();

    let stored = store.read("weather", 0).unwrap();
    let content = stored.request["messages"][1]["content"].as_str().unwrap();
    assert_eq!(content, "Weather in Paris at <timestamp> please");

    let replayer = memory_snapshot(weather_agent(Vec::new(), 5), &store);
    let replayed = replayer.replay(prompt, None).await.unwrap();
    assert_eq!(replayed.response, ANSWER);
}

#[tokio::test]
async fn test_streaming_fixture_replays_blocking() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let recorder = memory_snapshot(weather_agent(paris_script(), 5), &store);
    recorder
        .generate(RunOptions::streaming(PROMPT))
        .await
        .unwrap();

    // Blocking runs emit no chunk events, so only requests and tool calls are compared
    let replayer = memory_snapshot(weather_agent(Vec::new(), 5), &store);
    let overrides = ReplayOverrides::default()
        .with_verification(VerificationOverrides::default().with_event_streams(false));
    let replayed = replayer
        .replay(RunOptions::blocking(PROMPT), Some(overrides))
        .await
        .unwrap();
    assert_eq!(replayed.response, ANSWER);
    assert_eq!(replayed.meta.run_mode, RunMode::Blocking);
}

#[tokio::test]
async fn test_loops_replay_in_numeric_order() {
    let dir = TempDir::new().unwrap();
    let config = SnapshotConfig::new(dir.path(), "long_case");

    let mut script: Vec<LlmResponse> = (0..10)
        .map(|i| LlmResponse::tool_call("lookup", json!({"city": format!("city-{}", i)})))
        .collect();
    script.push(LlmResponse::text("Done."));

    let recorder = AgentSnapshot::new(weather_agent(script, 12), config.clone()).unwrap();
    assert_eq!(recorder.generate("Check every city").await.unwrap().loop_count, 11);

    let case_dir = dir.path().join("long_case");
    assert!(case_dir.join("loop-10").is_dir());
    std::fs::write(case_dir.join("notes"), "not a loop").unwrap();

    let store = FsSnapshotStore::new(dir.path());
    assert_eq!(store.count("long_case").unwrap(), 11);
    assert_eq!(store.loop_indices("long_case").unwrap(), (0..11).collect::<Vec<_>>());
    let tenth = store.read("long_case", 10).unwrap();
    assert_eq!(tenth.loop_index, 10);
    assert!(tenth.response.to_response().unwrap().is_final());

    let replayer = AgentSnapshot::new(weather_agent(Vec::new(), 12), config).unwrap();
    let replayed = replayer.replay("Check every city", None).await.unwrap();
    assert_eq!(replayed.loop_count, 11);
    assert_eq!(replayed.response, "Done.");
}

#[tokio::test]
async fn test_fewer_loops_is_loop_count_mismatch() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let script = vec![
        LlmResponse::tool_call("lookup", json!({"city": "Paris"})),
        LlmResponse::tool_call("lookup", json!({"city": "Lyon"})),
        LlmResponse::text(ANSWER),
    ];
    memory_snapshot(weather_agent(script, 5), &store)
        .generate(PROMPT)
        .await
        .unwrap();
    assert_eq!(store.count("weather").unwrap(), 3);

    // Same agent, but capped one loop short
    let replayer = memory_snapshot(weather_agent(Vec::new(), 2), &store);
    let err = replayer.replay(PROMPT, None).await.unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::LoopCountMismatch {
            expected: 3,
            actual: 2
        }
    ));
    assert!(err.to_string().contains("3"));
    assert!(store.actual("weather", 1).is_some());
}

#[tokio::test]
async fn test_changed_request_is_mismatch() {
    let store = Arc::new(InMemorySnapshotStore::new());
    memory_snapshot(weather_agent(paris_script(), 5), &store)
        .generate(PROMPT)
        .await
        .unwrap();
    edit_request(&store, 0, |request| {
        request["messages"][1]["content"] = json!("What is the weather in Berlin?");
    });

    let replayer = memory_snapshot(weather_agent(Vec::new(), 5), &store);
    let err = replayer.replay(PROMPT, None).await.unwrap_err();
    match &err {
        SnapshotError::RequestMismatch { loop_index, diff } => {
            assert_eq!(*loop_index, 0);
            let field = diff.at("messages[1].content").unwrap();
            assert_eq!(field.expected, Some(json!("What is the weather in Berlin?")));
            assert_eq!(field.actual, Some(json!(PROMPT)));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(replayer.current_loop(), 0);

    let actual = store.actual("weather", 0).unwrap();
    assert_eq!(actual.request["messages"][1]["content"], PROMPT);
}

#[tokio::test]
async fn test_normalized_field_change_is_ignored() {
    let store = Arc::new(InMemorySnapshotStore::new());
    memory_snapshot(weather_agent(paris_script(), 5), &store)
        .generate(PROMPT)
        .await
        .unwrap();
    edit_request(&store, 0, |request| {
        request["metadata"]["timestamp"] = json!("2001-02-03T04:05:06Z");
    });

    let replayer = memory_snapshot(weather_agent(Vec::new(), 5), &store);
    assert!(replayer.replay(PROMPT, None).await.is_ok());
}

#[tokio::test]
async fn test_update_mode_rewrites_request() {
    let store = Arc::new(InMemorySnapshotStore::new());
    memory_snapshot(weather_agent(paris_script(), 5), &store)
        .generate(PROMPT)
        .await
        .unwrap();
    edit_request(&store, 0, |request| {
        request["messages"][1]["content"] = json!("stale prompt");
    });

    let replayer = memory_snapshot(weather_agent(Vec::new(), 5), &store);
    let overrides = ReplayOverrides::default().with_update_snapshots(true);
    let result = replayer.replay(PROMPT, Some(overrides)).await.unwrap();
    assert!(result.meta.updated);
    assert_eq!(result.response, ANSWER);

    let record = store.read("weather", 0).unwrap();
    assert_eq!(record.request["messages"][1]["content"], PROMPT);
    assert!(!record.events.is_empty());

    // The rewritten case now replays cleanly
    assert!(replayer.replay(PROMPT, None).await.is_ok());
}

#[tokio::test]
async fn test_update_mode_truncates_and_extends() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let script = vec![
        LlmResponse::tool_call("lookup", json!({"city": "Paris"})),
        LlmResponse::tool_call("lookup", json!({"city": "Lyon"})),
        LlmResponse::text(ANSWER),
    ];
    memory_snapshot(weather_agent(script, 5), &store)
        .generate(PROMPT)
        .await
        .unwrap();

    let update = || Some(ReplayOverrides::default().with_update_snapshots(true));

    // Shorter run drops the surplus loop
    let short = memory_snapshot(weather_agent(Vec::new(), 2), &store);
    let result = short.replay(PROMPT, update()).await.unwrap();
    assert_eq!(result.loop_count, 2);
    assert_eq!(store.count("weather").unwrap(), 2);

    // Longer run forwards the extra loop to the agent's own client
    let long = memory_snapshot(weather_agent(vec![LlmResponse::text("Done.")], 5), &store);
    let result = long.replay(PROMPT, update()).await.unwrap();
    assert_eq!(result.response, "Done.");
    assert_eq!(result.loop_count, 3);
    assert_eq!(store.count("weather").unwrap(), 3);
    match &store.read("weather", 2).unwrap().response {
        RecordedResponse::Message(value) => assert_eq!(value["content"], "Done."),
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_case_fails_before_agent_runs() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let agent = weather_agent(paris_script(), 5);
    let replayer = memory_snapshot(Arc::clone(&agent), &store);

    let err = replayer.replay(PROMPT, None).await.unwrap_err();
    assert!(matches!(err, SnapshotError::SnapshotNotFound { ref case, .. } if case == "weather"));
    assert!(agent.events().is_empty());
    assert_eq!(agent.executed_loops(), 0);
}

#[tokio::test]
async fn test_empty_case_rejects_first_request() {
    let store = Arc::new(InMemorySnapshotStore::new());
    store.create_case("weather");

    let replayer = memory_snapshot(weather_agent(Vec::new(), 5), &store);
    let err = replayer.replay(PROMPT, None).await.unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::UnexpectedLoop {
            loop_index: 0,
            expected: 0
        }
    ));
}

#[tokio::test]
async fn test_unexpected_loop_capture_keeps_loop_count_on_disk() {
    let dir = TempDir::new().unwrap();
    let config = SnapshotConfig::new(dir.path(), "weather_paris");
    AgentSnapshot::new(weather_agent(paris_script(), 5), config.clone())
        .unwrap()
        .generate(PROMPT)
        .await
        .unwrap();

    let case_dir = dir.path().join("weather_paris");
    std::fs::remove_dir_all(case_dir.join("loop-1")).unwrap();

    let replayer = AgentSnapshot::new(weather_agent(Vec::new(), 5), config).unwrap();
    let err = replayer.replay(PROMPT, None).await.unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::UnexpectedLoop {
            loop_index: 1,
            expected: 1
        }
    ));

    assert!(case_dir.join("actual-loop-1").join("actual-request.json").is_file());
    assert!(!case_dir.join("loop-1").exists());
    let store = FsSnapshotStore::new(dir.path());
    assert_eq!(store.count("weather_paris").unwrap(), 1);
    assert_eq!(replayer.expected_loops().unwrap(), 1);
    assert_eq!(store.read_all("weather_paris").unwrap().len(), 1);

    store.cleanup_transient("weather_paris").unwrap();
    assert!(!case_dir.join("actual-loop-1").exists());
}

#[tokio::test]
async fn test_cancel_mid_stream() {
    let store = Arc::new(InMemorySnapshotStore::new());
    memory_snapshot(weather_agent(paris_script(), 5), &store)
        .generate(RunOptions::streaming(PROMPT))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let options = RunOptions::streaming(PROMPT)
        .with_cancel(cancel)
        .with_observer(move |envelope| {
            if matches!(envelope.event, AgentEvent::StreamChunk { .. }) {
                trigger.cancel();
            }
        });

    let replayer = memory_snapshot(weather_agent(Vec::new(), 5), &store);
    let err = replayer.replay(options, None).await.unwrap_err();

    // The first chunk belongs to loop 1; that loop was never fully delivered
    assert!(matches!(err, SnapshotError::Cancelled { loop_index: 1 }));
    assert_eq!(replayer.current_loop(), 1);
}

#[tokio::test]
async fn test_changed_tool_result_is_tool_call_mismatch() {
    let store = Arc::new(InMemorySnapshotStore::new());
    memory_snapshot(weather_agent(paris_script(), 5), &store)
        .generate(PROMPT)
        .await
        .unwrap();

    let mut record = store.read("weather", 0).unwrap();
    record.tool_calls[0]["result"]["sky"] = json!("rain");
    store.write("weather", &record).unwrap();

    let replayer = memory_snapshot(weather_agent(Vec::new(), 5), &store);
    let err = replayer.replay(PROMPT, None).await.unwrap_err();
    match err {
        SnapshotError::ToolCallMismatch { loop_index, diff } => {
            assert_eq!(loop_index, 0);
            assert!(diff.at("[0].result.sky").is_some());
        }
        other => panic!("unexpected error {:?}", other),
    }
}
