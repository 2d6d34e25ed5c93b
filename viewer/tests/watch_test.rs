//! Viewer sessions against a scripted monitor socket.

use std::path::PathBuf;

use esmon_monitor::ipc::protocol::{read_frame, write_frame, Frame};
use esmon_viewer::{watch, OutputFormat, ViewerError};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

const RECORD: &str = r#"{"eventtype":"file::create","processpath":"/usr/bin/touch","pid":12,"ppid":1,"isplatform":true,"timestamp":1700000000000,"username":"alice","signingid":"com.apple.touch","props":{"path":"/tmp/new","size":"0"}}"#;

/// Accepts one connection, expects `Register`, then plays `script`.
fn scripted_monitor(script: Vec<Frame>) -> (TempDir, PathBuf, JoinHandle<()>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("esmon.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), Some(Frame::Register));
        for frame in &script {
            write_frame(&mut stream, frame).await.unwrap();
        }
    });
    (dir, path, task)
}

#[tokio::test]
async fn prints_events_until_monitor_closes() {
    let (_dir, path, monitor) = scripted_monitor(vec![
        Frame::Ack(true),
        Frame::Event(RECORD.as_bytes().to_vec()),
        Frame::Event(b"{not json".to_vec()),
        Frame::Event(RECORD.as_bytes().to_vec()),
    ]);

    let mut out = Vec::new();
    let printed = watch(&path, OutputFormat::Json, &mut out).await.unwrap();
    monitor.await.unwrap();

    assert_eq!(printed, 2);
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"eventtype\":\"file::create\""));
}

#[tokio::test]
async fn pretty_output_includes_description() {
    let (_dir, path, monitor) = scripted_monitor(vec![
        Frame::Ack(true),
        Frame::Event(RECORD.as_bytes().to_vec()),
    ]);

    let mut out = Vec::new();
    watch(&path, OutputFormat::Pretty, &mut out).await.unwrap();
    monitor.await.unwrap();

    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("[2023-11-14T22:13:20.000Z]"));
    assert!(text.contains("Event Type: file::create"));
    assert!(text.contains("  path: /tmp/new"));
}

#[tokio::test]
async fn refused_registration_is_reported() {
    let (_dir, path, monitor) = scripted_monitor(vec![Frame::Ack(false)]);

    let mut out = Vec::new();
    let err = watch(&path, OutputFormat::Json, &mut out).await.unwrap_err();
    monitor.await.unwrap();

    assert!(matches!(err, ViewerError::Rejected));
    assert!(!err.is_transient());
    assert!(out.is_empty());
}

#[tokio::test]
async fn missing_monitor_is_transient() {
    let dir = tempfile::tempdir().unwrap();

    let mut out = Vec::new();
    let err = watch(&dir.path().join("absent.sock"), OutputFormat::Json, &mut out)
        .await
        .unwrap_err();

    assert!(matches!(err, ViewerError::Connect(_)));
    assert!(err.is_transient());
}
