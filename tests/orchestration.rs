//! Agent lifecycle scenarios with real child processes.
//!
//! Each test configures a small catalogue of shell agents, drives them through
//! the HTTP API and watches their output on the event stream.

use agentcast::config::{AgentDefinition, AgentsConfig, ServerConfig};
use agentcast::protocol::{AgentStatus, OutputKind, OutputMessage, StartRequest};
use agentcast::testing::{FrameReader, TestHarness};
use agentcast::ClientError;
use std::collections::HashMap;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn catalogue() -> AgentsConfig {
    let mut env_agent = AgentDefinition::new(
        "Env",
        "sh",
        &["-c", "echo \"token=$AGENTCAST_TEST_TOKEN\""],
    );
    env_agent.env_required = vec!["AGENTCAST_TEST_TOKEN".to_string()];

    let mut disabled = AgentDefinition::new("Disabled", "true", &[]);
    disabled.enabled = false;

    AgentsConfig::default()
        .with_agent(
            "echo",
            AgentDefinition::new("Echo", "sh", &["-c", "echo hello; sleep 0.2; echo bye"]),
        )
        .with_agent("cat", AgentDefinition::new("Cat", "cat", &[]))
        .with_agent(
            "fail",
            AgentDefinition::new("Fail", "sh", &["-c", "echo oops >&2; exit 3"]),
        )
        .with_agent("sleeper", AgentDefinition::new("Sleeper", "sleep", &["30"]))
        .with_agent("pwd", AgentDefinition::new("Pwd", "pwd", &[]))
        .with_agent("env", env_agent)
        .with_agent("disabled", disabled)
}

async fn harness() -> TestHarness {
    TestHarness::with_config(ServerConfig {
        agents: catalogue(),
        ..ServerConfig::default()
    })
    .await
    .expect("harness")
}

/// Read messages until one matches `kind` and `data`.
async fn wait_for_line(stream: &mut FrameReader, kind: OutputKind, data: &str) -> OutputMessage {
    loop {
        let message = stream
            .next_message(TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("waiting for {data:?}: {e}"));
        if message.kind == kind && message.data == data {
            return message;
        }
    }
}

#[tokio::test]
async fn test_start_streams_output_until_exit() {
    let harness = harness().await;

    let mut stream = harness.open_stream("echo").await.expect("open");
    stream.next_frame(TIMEOUT).await.expect("connected");
    let notice = stream.next_message(TIMEOUT).await.expect("notice");
    assert_eq!(notice.kind, OutputKind::System);
    harness
        .wait_for_subscribers("echo", 1, TIMEOUT)
        .await
        .expect("subscribed");

    let started = harness
        .client()
        .start("echo", &StartRequest::default())
        .await
        .expect("start");
    assert!(started.success);
    assert_eq!(started.agent_id, "echo");

    let first = stream.next_message(TIMEOUT).await.expect("started notice");
    assert_eq!(first.kind, OutputKind::System);
    assert_eq!(
        first.data,
        format!("Agent Echo started (job {})", started.job_id)
    );

    let hello = stream.next_message(TIMEOUT).await.expect("hello");
    assert_eq!((hello.kind, hello.data.as_str()), (OutputKind::Stdout, "hello"));
    let bye = stream.next_message(TIMEOUT).await.expect("bye");
    assert_eq!((bye.kind, bye.data.as_str()), (OutputKind::Stdout, "bye"));

    let exited = stream.next_message(TIMEOUT).await.expect("exit notice");
    assert_eq!(exited.kind, OutputKind::System);
    assert_eq!(exited.data, "Agent Echo exited with code 0");

    harness
        .wait_for_status("echo", AgentStatus::Stopped, TIMEOUT)
        .await
        .expect("stopped after exit");

    drop(stream);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_input_reaches_agent_stdin() {
    let harness = harness().await;
    let client = harness.client();

    client
        .start("cat", &StartRequest::default())
        .await
        .expect("start");
    harness
        .wait_for_status("cat", AgentStatus::Running, TIMEOUT)
        .await
        .expect("running");

    let mut stream = harness.open_stream("cat").await.expect("open");
    let connected = stream.next_frame(TIMEOUT).await.expect("connected");
    assert!(
        connected
            .data
            .as_deref()
            .is_some_and(|d| d.contains("\"running\""))
    );

    client.send("cat", "ping 1").await.expect("send");
    wait_for_line(&mut stream, OutputKind::Stdout, "ping 1").await;
    client.send("cat", "ping 2").await.expect("send");
    wait_for_line(&mut stream, OutputKind::Stdout, "ping 2").await;

    let stopped = client.stop("cat", false).await.expect("stop");
    assert!(stopped.success);
    wait_for_line(
        &mut stream,
        OutputKind::System,
        "Agent Cat was terminated by a signal",
    )
    .await;
    harness
        .wait_for_status("cat", AgentStatus::Stopped, TIMEOUT)
        .await
        .expect("stopped");

    let err = client.send("cat", "too late").await.unwrap_err();
    assert!(
        matches!(&err, ClientError::Api { status, message, .. }
            if status.as_u16() == 400 && message.starts_with("Failed to send command")),
        "{err}"
    );

    drop(stream);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_failing_agent_reports_error() {
    let harness = harness().await;
    let client = harness.client();

    client
        .start("fail", &StartRequest::default())
        .await
        .expect("start");
    harness
        .wait_for_status("fail", AgentStatus::Error, TIMEOUT)
        .await
        .expect("error after non-zero exit");

    let info = client.get("fail").await.expect("get");
    assert_eq!(info.status, AgentStatus::Error);
    assert_eq!(
        info.last_error.as_deref(),
        Some("Agent Fail exited with code 3")
    );
    assert!(info.current_job_id.is_none());

    let history = client.history("fail", None).await.expect("history");
    assert!(
        history
            .iter()
            .any(|m| m.kind == OutputKind::Stderr && m.data == "oops")
    );
    let last = history.last().expect("exit notice");
    assert_eq!(last.kind, OutputKind::Error);
    assert_eq!(last.data, "Agent Fail exited with code 3");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_start_and_stop_conflicts() {
    let harness = harness().await;
    let client = harness.client();

    let started = client
        .start("sleeper", &StartRequest::default())
        .await
        .expect("start");

    let err = client
        .start("sleeper", &StartRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("AGENT_ALREADY_RUNNING"));

    let info = client.get("sleeper").await.expect("get");
    assert_eq!(info.status, AgentStatus::Running);
    assert_eq!(info.current_job_id.as_deref(), Some(started.job_id.as_str()));

    client.stop("sleeper", false).await.expect("stop");
    harness
        .wait_for_status("sleeper", AgentStatus::Stopped, TIMEOUT)
        .await
        .expect("stopped");

    let err = client.stop("sleeper", false).await.unwrap_err();
    assert_eq!(err.code(), Some("AGENT_ALREADY_STOPPED"));

    // A stopped agent can run again under a new job id.
    let again = client
        .start("sleeper", &StartRequest::default())
        .await
        .expect("restart");
    assert_ne!(again.job_id, started.job_id);
    client.stop("sleeper", true).await.expect("force stop");
    harness
        .wait_for_status("sleeper", AgentStatus::Stopped, TIMEOUT)
        .await
        .expect("stopped");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_required_environment() {
    let harness = harness().await;
    let client = harness.client();

    let err = client
        .start("env", &StartRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("MISSING_ENVIRONMENT"));
    assert!(err.to_string().contains("AGENTCAST_TEST_TOKEN"));

    let request = StartRequest {
        environment: HashMap::from([("AGENTCAST_TEST_TOKEN".to_string(), "abc".to_string())]),
        ..StartRequest::default()
    };
    client.start("env", &request).await.expect("start with env");
    harness
        .wait_for_status("env", AgentStatus::Stopped, TIMEOUT)
        .await
        .expect("exited");

    let history = client.history("env", None).await.expect("history");
    assert!(history.iter().any(|m| m.data == "token=abc"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_disabled_agent_rejected() {
    let harness = harness().await;

    let err = harness
        .client()
        .start("disabled", &StartRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("AGENT_DISABLED"));
    assert_eq!(
        harness.status().get("disabled").status,
        AgentStatus::Stopped
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_working_directory_override() {
    let harness = harness().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let expected = dir.path().canonicalize().expect("canonicalize");

    let request = StartRequest {
        working_directory: Some(expected.clone()),
        ..StartRequest::default()
    };
    harness
        .client()
        .start("pwd", &request)
        .await
        .expect("start");
    harness
        .wait_for_status("pwd", AgentStatus::Stopped, TIMEOUT)
        .await
        .expect("exited");

    let history = harness.client().history("pwd", None).await.expect("history");
    let printed: Vec<_> = history
        .iter()
        .filter(|m| m.kind == OutputKind::Stdout)
        .map(|m| m.data.as_str())
        .collect();
    assert_eq!(printed, vec![expected.to_string_lossy().as_ref()]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_list_reports_catalogue_and_status() {
    let harness = harness().await;
    let client = harness.client();

    client
        .start("sleeper", &StartRequest::default())
        .await
        .expect("start");

    let agents = client.list().await.expect("list");
    let ids: Vec<_> = agents.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["cat", "disabled", "echo", "env", "fail", "pwd", "sleeper"]
    );

    let sleeper = agents.iter().find(|a| a.id == "sleeper").expect("sleeper");
    assert_eq!(sleeper.status, AgentStatus::Running);
    assert_eq!(sleeper.name, "Sleeper");
    assert!(sleeper.current_job_id.is_some());

    let disabled = agents.iter().find(|a| a.id == "disabled").expect("disabled");
    assert!(!disabled.enabled);

    client.stop("sleeper", true).await.expect("stop");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_independent_agents_stream_separately() {
    let harness = harness().await;
    let client = harness.client();

    let mut cat_stream = harness.open_stream("cat").await.expect("open cat");
    let mut echo_stream = harness.open_stream("echo").await.expect("open echo");
    cat_stream.next_frame(TIMEOUT).await.expect("connected");
    echo_stream.next_frame(TIMEOUT).await.expect("connected");
    harness
        .wait_for_subscribers("cat", 1, TIMEOUT)
        .await
        .expect("cat subscribed");
    harness
        .wait_for_subscribers("echo", 1, TIMEOUT)
        .await
        .expect("echo subscribed");

    client
        .start("cat", &StartRequest::default())
        .await
        .expect("start cat");
    client
        .start("echo", &StartRequest::default())
        .await
        .expect("start echo");

    wait_for_line(&mut echo_stream, OutputKind::Stdout, "bye").await;

    client.send("cat", "only for cat").await.expect("send");
    wait_for_line(&mut cat_stream, OutputKind::Stdout, "only for cat").await;

    let echo_history = client.history("echo", None).await.expect("history");
    assert!(echo_history.iter().all(|m| m.data != "only for cat"));
    let cat_history = client.history("cat", None).await.expect("history");
    assert!(cat_history.iter().all(|m| m.data != "hello"));

    client.stop("cat", true).await.expect("stop");
    drop(cat_stream);
    drop(echo_stream);
    harness.shutdown().await;
}
