//! Unit tests for JSON-RPC message classification.

use serde_json::json;

use acp_link::acp::message::{Message, RequestId, RpcError, METHOD_NOT_FOUND};
use acp_link::AppError;

#[test]
fn id_and_method_is_a_call() {
    let msg = Message::parse_line(
        r#"{"jsonrpc":"2.0","id":"perm-1","method":"session/request_permission","params":{"a":1}}"#,
    )
    .expect("valid");

    assert_eq!(
        msg,
        Message::Call {
            id: RequestId::Str("perm-1".into()),
            method: "session/request_permission".into(),
            params: json!({ "a": 1 }),
        }
    );
}

#[test]
fn id_and_result_is_a_successful_response() {
    let msg = Message::parse_line(r#"{"jsonrpc":"2.0","id":12,"result":{"sessionId":"abc"}}"#)
        .expect("valid");

    assert_eq!(
        msg,
        Message::Response {
            id: RequestId::Number(12),
            outcome: Ok(json!({ "sessionId": "abc" })),
        }
    );
}

#[test]
fn id_and_error_is_a_failed_response() {
    let msg = Message::parse_line(
        r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"nope","data":{"x":1}}}"#,
    )
    .expect("valid");

    let Message::Response { outcome: Err(err), .. } = msg else {
        panic!("expected error response");
    };
    assert_eq!(err.code, METHOD_NOT_FOUND);
    assert_eq!(err.message, "nope");
    assert_eq!(err.data, Some(json!({ "x": 1 })));
}

#[test]
fn method_without_id_is_a_notification() {
    let msg = Message::parse_line(r#"{"jsonrpc":"2.0","method":"session/update"}"#).expect("valid");

    assert_eq!(
        msg,
        Message::Notification {
            method: "session/update".into(),
            params: serde_json::Value::Null,
        }
    );
}

#[test]
fn shapeless_messages_are_parse_errors() {
    for line in [
        r#"{"jsonrpc":"2.0"}"#,
        r#"{"id":3}"#,
        r#"{"id":true,"method":"x"}"#,
        r#"{"method":42}"#,
        r#"[1,2,3]"#,
        r#""just a string""#,
        "{truncated",
    ] {
        assert!(
            matches!(Message::parse_line(line), Err(AppError::TransportParse(_))),
            "{line} should not classify"
        );
    }
}

#[test]
fn outbound_messages_carry_the_version_tag() {
    let call = Message::Call {
        id: RequestId::Number(1),
        method: "initialize".into(),
        params: json!({ "protocolVersion": 1 }),
    };
    let notification = Message::Notification {
        method: "session/cancel".into(),
        params: serde_json::Value::Null,
    };
    let error = Message::Response {
        id: RequestId::Str("x".into()),
        outcome: Err(RpcError::method_not_found("fs/read")),
    };

    assert_eq!(
        call.to_value(),
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": { "protocolVersion": 1 } })
    );
    assert_eq!(
        notification.to_value(),
        json!({ "jsonrpc": "2.0", "method": "session/cancel" })
    );
    let error = error.to_value();
    assert_eq!(error["id"], "x");
    assert_eq!(error["error"]["code"], METHOD_NOT_FOUND);
    assert!(error.get("result").is_none());
}

#[test]
fn request_ids_display_bare() {
    assert_eq!(RequestId::Number(9).to_string(), "9");
    assert_eq!(RequestId::Str("a-1".into()).to_string(), "a-1");
}
