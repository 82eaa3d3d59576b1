//! Daemon smoke tests - boot sequence and graceful shutdown against the
//! scripted mock provider.

use minion_core::{AgentClass, AgentName, HpMode};
use minion_daemon::{AgentDaemon, DaemonConfig, EXIT_GRACEFUL};
use minion_provider::MockProvider;
use minion_test_utils::TestStore;
use std::sync::Arc;

#[tokio::test]
async fn boot_registers_writes_telemetry_and_honors_stand_down() {
    let mut fixture = TestStore::new();
    let lead = fixture.agent("commander", AgentClass::Lead);
    // The party is already dismissed: the daemon should boot, observe the
    // flag on its first poll, and exit gracefully.
    fixture.store.stand_down(&lead).unwrap();

    let agent = AgentName::from("c1");
    let provider = Arc::new(MockProvider::with_script([
        r#"{"type":"text","text":"booted"}"#,
        r#"{"type":"result","usage":{"input":14000,"output":600,"window":200000}}"#,
    ]));
    let config = DaemonConfig {
        agent: agent.clone(),
        class: AgentClass::Coder,
        model: None,
        provider: "mock".to_string(),
        project_dir: fixture.root().to_path_buf(),
        docs_dir: None,
        allowed_tools: None,
        permission_mode: None,
    };

    let store = fixture.reopen();
    let mut daemon = AgentDaemon::new(config, store, provider);
    let code = daemon.run().await.unwrap();
    assert_eq!(code, EXIT_GRACEFUL);

    // Boot sequence side effects: registered, context set, status set.
    let registered = fixture.store.get_agent(&agent).unwrap().unwrap();
    assert_eq!(registered.status, "ready for orders");
    assert_eq!(registered.context_summary.as_deref(), Some("just started"));

    // Stream telemetry landed as daemon-mode HP.
    assert_eq!(registered.hp.mode, HpMode::Daemon);
    assert_eq!(registered.hp.turn_input, Some(14_000));
    assert_eq!(registered.hp.tokens_limit, Some(200_000));

    // State file reflects the stop.
    let state_path = fixture.store.paths().state_file(&agent);
    let state: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(state_path).unwrap()).unwrap();
    assert_eq!(state["status"], "stopped");

    // The stream tail mirror captured the boot output.
    let tail = std::fs::read_to_string(fixture.store.paths().stream_tail_file(&agent)).unwrap();
    assert!(tail.contains("booted"));
}
