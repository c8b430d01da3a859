//! End-to-end tests against real child processes (`toolmux-echo-server`).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use toolmux::mcp_client::{
    load_servers_config, ConnectionState, McpError, MultiServerClient, ServerSpec, ServerSpecs,
};

const ECHO: &str = env!("CARGO_BIN_EXE_toolmux-echo-server");
const CONNECT: Duration = Duration::from_secs(10);

fn echo(name: &str, extra: &[&str]) -> ServerSpec {
    let mut args = vec!["--name".to_string(), name.to_string()];
    args.extend(extra.iter().map(|s| s.to_string()));
    ServerSpec::stdio(name, ECHO, args).unwrap()
}

fn missing(name: &str) -> ServerSpec {
    ServerSpec::stdio(name, "/nonexistent", Vec::<String>::new()).unwrap()
}

fn specs(list: Vec<ServerSpec>) -> ServerSpecs {
    ServerSpecs::from_specs(list).unwrap()
}

fn qualified_names(client: &MultiServerClient) -> Vec<String> {
    client
        .list_tools()
        .into_iter()
        .map(|t| t.qualified_name)
        .collect()
}

async fn connected(list: Vec<ServerSpec>) -> MultiServerClient {
    let client = MultiServerClient::new();
    let results = client.connect_all(&specs(list), CONNECT).await;
    assert!(results.values().all(|ok| *ok), "expected every server to connect: {results:?}");
    client
}

#[tokio::test]
async fn test_valid_and_missing_server() {
    let client = MultiServerClient::new();
    let results = client
        .connect_all(&specs(vec![echo("A", &[]), missing("B")]), Duration::from_secs(5))
        .await;

    assert_eq!(results.get("A"), Some(&true));
    assert_eq!(results.get("B"), Some(&false));
    assert_eq!(client.get_connected_servers(), vec!["A"]);
    assert!(!client.is_offline());

    let output = client.call("A.ping", json!({})).await.unwrap();
    assert_eq!(output.tool, "A.ping");
    assert_eq!(output.server, "A");
    assert_eq!(output.text().as_deref(), Some("pong from A"));
    assert!(!output.is_error());

    let err = client.call("B.anything", json!({})).await.unwrap_err();
    assert!(
        matches!(err, McpError::NotConnected { .. }) || err.is_tool_not_found(),
        "unexpected error: {err:?}"
    );

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_results_cover_every_spec() {
    let list = vec![
        echo("one", &[]),
        missing("two"),
        echo("three", &["--exit-on-init"]),
    ];
    let expected: BTreeSet<String> = list.iter().map(|s| s.name.clone()).collect();

    let client = MultiServerClient::new();
    let results = client.connect_all(&specs(list), CONNECT).await;

    let keys: BTreeSet<String> = results.keys().cloned().collect();
    assert_eq!(keys, expected);
    assert!(results["one"]);
    assert!(!results["two"]);
    assert!(!results["three"]);

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_missing_command_leaves_no_process() {
    let client = MultiServerClient::new();
    client.connect_all(&specs(vec![missing("gone")]), CONNECT).await;

    let statuses = client.server_status();
    let status = &statuses[0];
    assert_eq!(status.state, ConnectionState::Failed);
    assert!(status.pid.is_none());
    assert!(client.is_offline());
}

#[tokio::test]
async fn test_slow_servers_time_out_concurrently() {
    let mut list: Vec<ServerSpec> = (0..5)
        .map(|i| echo(&format!("slow{i}"), &["--hang-on-init"]))
        .collect();
    list.push(echo("fast", &[]));

    let timeout = Duration::from_secs(1);
    let client = MultiServerClient::new();
    let started = Instant::now();
    let results = client.connect_all(&specs(list), timeout).await;
    let elapsed = started.elapsed();

    // Five sequential timeouts would take at least five seconds.
    assert!(elapsed < Duration::from_secs(3), "connect_all took {elapsed:?}");
    assert_eq!(client.get_connected_servers(), vec!["fast"]);
    for i in 0..5 {
        let name = format!("slow{i}");
        assert!(!results[&name]);
        assert_eq!(
            client.connection(&name).unwrap().state(),
            ConnectionState::Failed
        );
        assert!(client
            .connection(&name)
            .unwrap()
            .last_error()
            .unwrap()
            .contains("timed out"));
    }

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_catalog_is_union_of_connected_servers() {
    let client = MultiServerClient::new();
    let results = client
        .connect_all(
            &specs(vec![
                echo("a", &[]),
                echo("b", &["--exit-on-init"]),
                echo("c", &["--tool", "ping", "--tool", "search"]),
            ]),
            CONNECT,
        )
        .await;

    assert!(!results["b"]);
    assert_eq!(
        qualified_names(&client),
        vec!["a.echo", "a.ping", "c.ping", "c.search"]
    );
    assert_eq!(client.catalog().server_names(), vec!["a", "c"]);

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_bare_name_ambiguity_across_servers() {
    let client = connected(vec![
        echo("web", &["--tool", "search", "--tool", "lookup"]),
        echo("docs", &["--tool", "search"]),
    ])
    .await;

    match client.call("search", json!({"message": "rust"})).await.unwrap_err() {
        McpError::AmbiguousTool { candidates, .. } => {
            assert_eq!(candidates, vec!["docs.search", "web.search"]);
        }
        other => panic!("expected AmbiguousTool, got {other:?}"),
    }

    let web = client.call("web.search", json!({"message": "rust"})).await.unwrap();
    assert_eq!(web.text().as_deref(), Some("search from web: rust"));
    let docs = client.call("docs.search", json!({"message": "rust"})).await.unwrap();
    assert_eq!(docs.text().as_deref(), Some("search from docs: rust"));

    // A bare name held by one server still resolves.
    let lookup = client.call("lookup", json!({"message": "x"})).await.unwrap();
    assert_eq!(lookup.server, "web");

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_call_after_owner_disconnects() {
    let client = connected(vec![echo("a", &[]), echo("b", &[])]).await;

    // Torn down behind the catalog's back: the tool is still listed.
    client.connection("a").unwrap().disconnect().await;
    assert!(client.catalog().lookup_by_qualified_name("a.ping").is_some());
    let err = client.call("a.ping", json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        McpError::NotConnected { state: ConnectionState::Closed, .. }
    ));

    // Through the client: the catalog is refreshed, the error is the same kind.
    assert!(client.disconnect_server("b").await);
    assert!(client.catalog().tools_for_server("b").is_empty());
    let err = client.call("b.ping", json!({})).await.unwrap_err();
    assert!(matches!(err, McpError::NotConnected { ref name, .. } if name == "b"));

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_disconnect_all_is_repeatable() {
    let client = connected(vec![echo("a", &[])]).await;
    let conn = client.connection("a").unwrap();

    client.disconnect_all().await;
    client.disconnect_all().await;

    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(client.get_connected_servers().is_empty());
    assert!(client.catalog().is_empty());
    assert!(client.is_offline());

    let empty = MultiServerClient::new();
    empty.disconnect_all().await;
    empty.disconnect_all().await;
}

#[tokio::test]
async fn test_call_timeout_leaves_channel_usable() {
    let client = connected(vec![echo("a", &["--slow-tool", "echo", "--call-delay-ms", "1500"])]).await;

    let err = client
        .call_within("a.echo", json!({"message": "late"}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err:?}");

    let pong = client.call("a.ping", json!({})).await.unwrap();
    assert_eq!(pong.text().as_deref(), Some("pong from a"));

    // Outlive the abandoned call; its reply must not leak into later calls.
    tokio::time::sleep(Duration::from_millis(1600)).await;
    let pong = client.call("a.ping", json!({})).await.unwrap();
    assert_eq!(pong.text().as_deref(), Some("pong from a"));
    assert!(client.connection("a").unwrap().is_connected());

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_paired() {
    let client = Arc::new(connected(vec![echo("a", &[])]).await);

    let calls = (0..16).map(|i| {
        let client = Arc::clone(&client);
        async move {
            let msg = format!("message {i}");
            let output = client.call("a.echo", json!({"message": msg})).await.unwrap();
            (msg, output.text().unwrap_or_default())
        }
    });

    for (msg, text) in futures::future::join_all(calls).await {
        assert_eq!(text, format!("echo from a: {msg}"));
    }

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_server_crash_is_surfaced() {
    let client = connected(vec![
        echo("a", &["--crash-tool", "echo"]),
        echo("b", &[]),
    ])
    .await;

    let err = client
        .call("a.echo", json!({"message": "boom"}))
        .await
        .unwrap_err();
    match err {
        McpError::ServerCrashed { name, reason } => {
            assert_eq!(name, "a");
            assert!(reason.contains("crashing on echo"), "reason: {reason}");
        }
        other => panic!("expected ServerCrashed, got {other:?}"),
    }

    assert_eq!(client.connection("a").unwrap().state(), ConnectionState::Closed);
    assert_eq!(client.get_connected_servers(), vec!["b"]);
    assert_eq!(qualified_names(&client), vec!["b.echo", "b.ping"]);

    // The surviving server is unaffected.
    assert!(client.call("b.ping", json!({})).await.is_ok());

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_paginated_tool_list() {
    let client = connected(vec![echo(
        "paged",
        &["--tool", "a", "--tool", "b", "--tool", "c", "--tool", "d", "--tool", "e", "--page-size", "2"],
    )])
    .await;

    assert_eq!(
        qualified_names(&client),
        vec!["paged.a", "paged.b", "paged.c", "paged.d", "paged.e"]
    );
    assert_eq!(client.server_tools("paged").unwrap().len(), 5);

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_tool_list_error_keeps_server_without_tools() {
    let client = connected(vec![echo("bare", &["--fail-list"])]).await;

    assert_eq!(client.get_connected_servers(), vec!["bare"]);
    assert!(client.catalog().is_empty());
    assert_eq!(client.server_status()[0].tool_count, 0);

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_stdout_noise_is_ignored() {
    let client = connected(vec![echo("chatty", &["--noise"])]).await;

    let output = client.call("ping", json!(null)).await.unwrap();
    assert_eq!(output.text().as_deref(), Some("pong from chatty"));

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_arguments_are_validated_before_sending() {
    let client = connected(vec![echo("a", &[])]).await;

    let missing = client.call("a.echo", json!({})).await.unwrap_err();
    assert!(matches!(missing, McpError::InvalidArguments { ref tool, .. } if tool == "a.echo"));

    let wrong = client.call("a.echo", json!({"message": 5})).await.unwrap_err();
    assert!(wrong.to_string().contains("should be string"));

    let ok = client.call("a.echo", json!({"message": "fine"})).await.unwrap();
    assert_eq!(ok.text().as_deref(), Some("echo from a: fine"));

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_spawned_calls_can_be_joined_or_aborted() {
    let client = Arc::new(
        connected(vec![echo("a", &["--slow-tool", "echo", "--call-delay-ms", "5000"])]).await,
    );

    let quick = client.spawn_call("a.ping", json!({}));
    let output = quick.join().await.unwrap();
    assert_eq!(output.text().as_deref(), Some("pong from a"));

    let slow = client.spawn_call("a.echo", json!({"message": "never"}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!slow.is_finished());
    slow.abort();
    assert!(matches!(slow.join().await, Err(McpError::Cancelled { .. })));

    // Aborting did not disturb the connection.
    assert!(client.call("a.ping", json!({})).await.is_ok());

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_connect_all_replaces_same_name() {
    let client = MultiServerClient::new();
    let first_specs = specs(vec![echo("a", &[])]);

    client.connect_all(&first_specs, CONNECT).await;
    let first = client.connection("a").unwrap();

    let results = client.connect_all(&first_specs, CONNECT).await;
    let second = client.connection("a").unwrap();

    assert!(results["a"]);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first.state(), ConnectionState::Closed);
    assert!(second.is_connected());
    assert_eq!(qualified_names(&client), vec!["a.echo", "a.ping"]);

    client.disconnect_all().await;
}

#[tokio::test]
async fn test_handshake_failure_carries_stderr() {
    let client = MultiServerClient::new();
    client
        .connect_all(&specs(vec![echo("grumpy", &["--exit-on-init"])]), CONNECT)
        .await;

    let error = client.connection("grumpy").unwrap().last_error().unwrap();
    assert!(error.contains("refusing to initialize"), "error: {error}");
}

#[tokio::test]
async fn test_config_file_drives_connect_all() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("mcp_servers.json");
    let doc = json!({
        "mcpServers": {
            "files": {"type": "stdio", "command": ECHO, "args": ["--name", "files"]},
            "broken": {"type": "sse", "command": ECHO}
        }
    });
    std::fs::write(&path, doc.to_string()).unwrap();

    let specs = load_servers_config(&path).unwrap();
    assert_eq!(specs.names(), vec!["files"]);
    assert_eq!(specs.skipped()[0].name, "broken");

    let client = MultiServerClient::new();
    let results = client.connect_all(&specs, CONNECT).await;
    assert_eq!(results.len(), 1);
    assert!(results["files"]);

    let output = client.call("files.echo", json!({"message": "hi"})).await.unwrap();
    assert_eq!(output.text().as_deref(), Some("echo from files: hi"));
    assert!(output.execution_time_ms < CONNECT.as_millis() as u64);

    client.disconnect_all().await;
}
