//! Transport tests against an in-process fake agent.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use acp_link::acp::handshake::{await_ready, HandshakePolicy};
use acp_link::acp::message::METHOD_NOT_FOUND;
use acp_link::acp::router::{Inbound, MethodFilter, NotificationRouter};
use acp_link::acp::spawner::{AgentIo, BoxedReader};
use acp_link::acp::transport::{Transport, STDERR_TAIL_LINES};
use acp_link::orchestrator::endpoint::Endpoint;
use acp_link::AppError;

use super::test_helpers::{eventually, fake_agent, AgentScript};

struct Harness {
    transport: Arc<Transport>,
    script: Arc<AgentScript>,
    kill: CancellationToken,
}

fn start(router: NotificationRouter) -> Harness {
    let script = AgentScript::new();
    let kill = CancellationToken::new();
    let io = fake_agent(Arc::clone(&script), kill.clone());
    let transport = Transport::start(Endpoint::Stdio, io, router, Duration::from_secs(2));
    Harness {
        transport,
        script,
        kill,
    }
}

/// Agent-side ends of hand-wired pipes; dropping one closes that channel.
struct RawAgent {
    input: DuplexStream,
    output: DuplexStream,
}

/// Transport over bare pipes with no agent behind them.
fn start_raw(capacity: usize, stderr: Option<DuplexStream>) -> (Arc<Transport>, RawAgent) {
    let (client_out, input) = tokio::io::duplex(capacity);
    let (output, client_in) = tokio::io::duplex(capacity);
    let io = AgentIo {
        reader: Box::new(client_in),
        writer: Box::new(client_out),
        stderr: stderr.map(|s| -> BoxedReader { Box::new(s) }),
        child: None,
    };
    let transport = Transport::start(
        Endpoint::Stdio,
        io,
        NotificationRouter::new(),
        Duration::from_secs(2),
    );
    (transport, RawAgent { input, output })
}

#[tokio::test]
async fn call_resolves_with_the_agent_result() {
    let h = start(NotificationRouter::new());

    let result = h.transport.send("echo", json!({ "x": 1 })).await.expect("echo");

    assert_eq!(result, json!({ "x": 1 }));
    assert_eq!(h.transport.outstanding_calls(), 0);
    let sent = h.script.calls_to("echo");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["jsonrpc"], "2.0");
    assert_eq!(sent[0]["id"], 1);
}

#[tokio::test]
async fn concurrent_calls_are_correlated_by_id() {
    let h = start(NotificationRouter::new());

    let calls = (0..8).map(|n| {
        let transport = Arc::clone(&h.transport);
        tokio::spawn(async move { (n, transport.send("echo", json!({ "n": n })).await) })
    });
    let results = futures_util::future::join_all(calls).await;

    for joined in results {
        let (n, result) = joined.expect("join");
        assert_eq!(result.expect("echo"), json!({ "n": n }));
    }
}

#[tokio::test]
async fn structured_error_surfaces_as_remote() {
    let h = start(NotificationRouter::new());

    let err = h
        .transport
        .send("no/such/method", json!({}))
        .await
        .expect_err("unknown method");

    assert!(matches!(err, AppError::Remote(e) if e.code == METHOD_NOT_FOUND));
    assert!(!h.transport.is_closed());
}

#[tokio::test]
async fn unanswered_call_times_out_without_closing() {
    let h = start(NotificationRouter::new());

    let err = h
        .transport
        .request("hang", json!({}), Duration::from_millis(50))
        .await
        .expect_err("no answer");

    assert!(matches!(err, AppError::RequestTimeout(_)));
    assert_eq!(h.transport.outstanding_calls(), 0);
    assert!(h.transport.send("echo", json!(1)).await.is_ok());
}

#[tokio::test]
async fn agent_exit_fails_every_outstanding_call() {
    let h = start(NotificationRouter::new());
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let transport = Arc::clone(&h.transport);
            tokio::spawn(async move {
                transport
                    .request("hang", json!({}), Duration::from_secs(30))
                    .await
            })
        })
        .collect();
    let transport = Arc::clone(&h.transport);
    assert!(eventually(Duration::from_secs(2), || transport.outstanding_calls() == 3).await);

    h.kill.cancel();

    for waiter in waiters {
        let outcome = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("settles promptly")
            .expect("join");
        assert!(matches!(outcome, Err(AppError::ConnectionLost(_))));
    }
    let disconnect = h.transport.closed().await;
    assert!(!disconnect.requested);
    assert_eq!(disconnect.reason, "stream closed");
    assert!(h.transport.is_closed());
}

#[tokio::test]
async fn calls_after_close_fail_fast() {
    let h = start(NotificationRouter::new());

    h.transport.close().await;

    let call = tokio::time::timeout(Duration::from_millis(200), h.transport.send("echo", json!({})))
        .await
        .expect("no wait");
    assert!(matches!(call, Err(AppError::ConnectionLost(_))));
    assert!(matches!(
        h.transport.notify("session/cancel", json!({})).await,
        Err(AppError::ConnectionLost(_))
    ));
    let disconnect = h.transport.disconnect().expect("closed");
    assert!(disconnect.requested);
}

#[tokio::test]
async fn close_is_idempotent() {
    let h = start(NotificationRouter::new());

    h.transport.close().await;
    h.transport.close().await;

    assert_eq!(h.transport.disconnect().map(|d| d.reason), Some("closed by client".into()));
}

#[tokio::test]
async fn malformed_line_is_skipped_and_counted() {
    let h = start(NotificationRouter::new());

    let result = h
        .transport
        .send("agent/send", json!({ "raw": "{this is not json" }))
        .await;

    assert!(result.is_ok(), "response after the garbage line still arrives");
    assert_eq!(h.transport.parse_error_count(), 1);
    assert!(!h.transport.is_closed());
}

#[tokio::test]
async fn notifications_are_routed_before_the_response() {
    let router = NotificationRouter::new();
    let (_token, mut updates) = router.register_channel(MethodFilter::exact("session/update"));
    let h = start(router);

    let result = h
        .transport
        .send("session/prompt", json!({ "sessionId": "s-1", "prompt": [] }))
        .await
        .expect("prompt");

    assert_eq!(result["stopReason"], "end_turn");
    let update = updates.try_recv().expect("update delivered first");
    assert!(matches!(update, Inbound::Notification { .. }));
    assert_eq!(update.params()["sessionId"], "s-1");
}

#[tokio::test]
async fn unsupported_inbound_call_is_answered_with_method_not_found() {
    let h = start(NotificationRouter::new());
    let inbound = json!({ "jsonrpc": "2.0", "id": 77, "method": "fs/unknown", "params": {} });

    h.transport
        .send("agent/send", json!({ "message": inbound }))
        .await
        .expect("agent/send");

    let script = Arc::clone(&h.script);
    assert!(
        eventually(Duration::from_secs(2), || script.response_with_id(&json!(77)).is_some()).await
    );
    let reply = h.script.response_with_id(&json!(77)).expect("reply");
    assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
}

#[tokio::test]
async fn inbound_call_is_answered_by_its_handler() {
    let router = NotificationRouter::new();
    let (_token, mut calls) =
        router.register_channel(MethodFilter::exact("session/request_permission"));
    tokio::spawn(async move {
        while let Some(Inbound::Call(call)) = calls.recv().await {
            let _ = call.respond(json!({ "outcome": { "outcome": "selected", "optionId": "allow" } })).await;
        }
    });
    let h = start(router);
    let inbound = json!({
        "jsonrpc": "2.0",
        "id": "perm-1",
        "method": "session/request_permission",
        "params": { "sessionId": "s-1" }
    });

    h.transport
        .send("agent/send", json!({ "message": inbound }))
        .await
        .expect("agent/send");

    let script = Arc::clone(&h.script);
    assert!(
        eventually(Duration::from_secs(2), || script
            .response_with_id(&json!("perm-1"))
            .is_some())
        .await
    );
    let reply = h.script.response_with_id(&json!("perm-1")).expect("reply");
    assert_eq!(reply["result"]["outcome"]["optionId"], "allow");
}

#[tokio::test]
async fn stale_response_for_unknown_id_is_ignored() {
    let h = start(NotificationRouter::new());
    let stale = json!({ "jsonrpc": "2.0", "id": 9999, "result": {} });

    let result = h
        .transport
        .send("agent/send", json!({ "message": stale }))
        .await;

    assert!(result.is_ok());
    assert_eq!(h.transport.parse_error_count(), 0);
    assert!(!h.transport.is_closed());
}

#[tokio::test]
async fn call_times_out_when_the_agent_stops_reading() {
    let (transport, _agent) = start_raw(16, None);
    let padding = "x".repeat(200);

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        transport.request("initialize", json!({ "padding": padding }), Duration::from_millis(100)),
    )
    .await
    .expect("bounded by the call timeout");

    assert!(matches!(outcome, Err(AppError::RequestTimeout(_))), "{outcome:?}");
    assert_eq!(transport.outstanding_calls(), 0);
    let disconnect = transport.disconnect().expect("stalled wire closes the transport");
    assert!(!disconnect.requested);
    assert!(disconnect.reason.contains("write stalled"), "{}", disconnect.reason);
}

#[tokio::test]
async fn callers_queued_behind_a_stalled_write_do_not_hang() {
    let (transport, _agent) = start_raw(16, None);
    let padding = "x".repeat(200);
    let stuck = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .request("initialize", json!({ "padding": padding }), Duration::from_millis(100))
                .await
        })
    };
    let observed = Arc::clone(&transport);
    assert!(eventually(Duration::from_secs(1), || observed.outstanding_calls() == 1).await);

    let queued = tokio::time::timeout(
        Duration::from_secs(2),
        transport.request("echo", json!({}), Duration::from_secs(30)),
    )
    .await
    .expect("released when the stalled write gives up");

    assert!(matches!(queued, Err(AppError::ConnectionLost(_))), "{queued:?}");
    let stuck = stuck.await.expect("join");
    assert!(matches!(stuck, Err(AppError::RequestTimeout(_))), "{stuck:?}");
}

#[tokio::test]
async fn write_failure_closes_the_transport() {
    let (transport, agent) = start_raw(1024, None);
    drop(agent.input);

    let err = transport.send("echo", json!({})).await.expect_err("broken pipe");

    assert!(matches!(err, AppError::ConnectionLost(_)), "{err:?}");
    let disconnect = transport.disconnect().expect("closed");
    assert!(!disconnect.requested);
    assert!(disconnect.reason.contains("write failed"), "{}", disconnect.reason);
    assert_eq!(transport.outstanding_calls(), 0);
}

#[tokio::test]
async fn notify_write_failure_is_connection_lost() {
    let (transport, agent) = start_raw(1024, None);
    drop(agent.input);

    let err = transport
        .notify("session/cancel", json!({ "sessionId": "s-1" }))
        .await
        .expect_err("broken pipe");

    assert!(matches!(err, AppError::ConnectionLost(_)), "{err:?}");
    assert!(transport.is_closed());
    assert!(!transport.disconnect().expect("closed").requested);
}

#[tokio::test]
async fn disconnect_carries_the_stderr_tail() {
    let (mut stderr, client_stderr) = tokio::io::duplex(64 * 1024);
    let (transport, agent) = start_raw(1024, Some(client_stderr));

    for n in 0..70 {
        stderr
            .write_all(format!("line {n}\n").as_bytes())
            .await
            .expect("stderr write");
    }
    drop(stderr);
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(agent.output);

    let disconnect = tokio::time::timeout(Duration::from_secs(2), transport.closed())
        .await
        .expect("closes on EOF");

    assert!(!disconnect.requested);
    assert_eq!(disconnect.stderr_tail.len(), STDERR_TAIL_LINES);
    assert_eq!(disconnect.stderr_tail.first().map(String::as_str), Some("line 6"));
    assert_eq!(disconnect.stderr_tail.last().map(String::as_str), Some("line 69"));
}

#[tokio::test]
async fn handshake_with_an_agent_that_never_reads_settles_in_time() {
    let (transport, _agent) = start_raw(16, None);
    let policy = HandshakePolicy {
        readiness_timeout: Duration::from_secs(1),
        max_probes: 3,
        initial_spacing: Duration::from_millis(10),
        probe_timeout: Duration::from_millis(100),
        protocol_version: 1,
    };

    let outcome = tokio::time::timeout(Duration::from_secs(2), await_ready(&transport, &policy))
        .await
        .expect("bounded by the readiness deadline");

    let err = outcome.expect_err("never ready");
    assert!(err.is_connection_level(), "{err:?}");
    assert!(transport.is_closed());
}
