//! Unit tests for `AppError` display and classification.

use acp_link::acp::message::RpcError;
use acp_link::AppError;

#[test]
fn display_is_kind_prefixed() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Io("eof".into()), "io: eof"),
        (AppError::Acp("no active session".into()), "acp: no active session"),
        (
            AppError::EndpointUnavailable("tcp:4096 is occupied".into()),
            "endpoint unavailable: tcp:4096 is occupied",
        ),
        (AppError::ProcessSpawnFailed("x".into()), "process spawn failed: x"),
        (AppError::HandshakeTimeout("x".into()), "handshake timeout: x"),
        (AppError::TransportParse("x".into()), "transport parse: x"),
        (AppError::RequestTimeout("x".into()), "request timeout: x"),
        (AppError::ConnectionLost("x".into()), "connection lost: x"),
        (
            AppError::Remote(RpcError::new(-32601, "method not supported: fs/x")),
            "remote error -32601: method not supported: fs/x",
        ),
        (AppError::SessionCreationFailed("x".into()), "session creation failed: x"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn connect_time_failures_are_connection_level() {
    assert!(AppError::EndpointUnavailable(String::new()).is_connection_level());
    assert!(AppError::ProcessSpawnFailed(String::new()).is_connection_level());
    assert!(AppError::HandshakeTimeout(String::new()).is_connection_level());
    assert!(!AppError::ConnectionLost(String::new()).is_connection_level());
    assert!(!AppError::RequestTimeout(String::new()).is_connection_level());
}

#[test]
fn context_keeps_the_kind() {
    let err = AppError::HandshakeTimeout("no answer".into()).with_context("all 3 endpoint candidate(s) failed");

    assert_eq!(
        err,
        AppError::HandshakeTimeout("all 3 endpoint candidate(s) failed: no answer".into())
    );
    assert_eq!(
        AppError::ConnectionLost("gone".into()).with_context("ignored"),
        AppError::ConnectionLost("gone".into())
    );
}

#[test]
fn io_and_toml_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    assert_eq!(AppError::from(io), AppError::Io("pipe closed".into()));

    let toml_err = toml::from_str::<toml::Value>("= broken").expect_err("invalid toml");
    assert!(matches!(AppError::from(toml_err), AppError::Config(msg) if msg.starts_with("invalid config")));
}
