//! Transcode sessions against a stand-in ffmpeg script.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use vega_relay::config::TranscodeConfig;
use vega_relay::transcode::{EndReason, SessionState, TranscodeError, TranscodeProxy};

fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
    let script = dir.join("ffmpeg");
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn proxy(ffmpeg: PathBuf) -> TranscodeProxy {
    TranscodeProxy::new(&TranscodeConfig {
        ffmpeg_path: Some(ffmpeg),
        stderr_lines: 4,
    })
}

#[tokio::test]
async fn passes_upstream_and_referer_to_ffmpeg() {
    let dir = tempfile::tempdir().unwrap();
    let args_file = dir.path().join("args.txt");
    let script = fake_ffmpeg(
        dir.path(),
        &format!("printf '%s\\n' \"$@\" > '{}'\nprintf 'moof'", args_file.display()),
    );
    let proxy = proxy(script);

    let mut stream = proxy
        .open("https://cdn.example/show/ep1.mkv", Some("https://site.example/watch"))
        .unwrap();
    let handle = stream.handle();
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    handle.closed().await;

    assert_eq!(out, b"moof");
    assert_eq!(handle.end_signals(), 1);
    assert_eq!(handle.upstream(), "https://cdn.example/show/ep1.mkv");
    assert_eq!(handle.referer(), Some("https://site.example/watch"));

    let args = std::fs::read_to_string(&args_file).unwrap();
    assert!(args.contains("Referer: https://site.example/watch"));
    assert!(args.contains("https://cdn.example/show/ep1.mkv"));
    assert!(args.contains("frag_keyframe+empty_moov"));
    assert!(args.trim_end().ends_with("pipe:1"));
}

#[tokio::test]
async fn cancel_kills_and_signals_end_once() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_ffmpeg(dir.path(), "while true; do printf 'frag'; sleep 0.05; done");
    let proxy = proxy(script);

    let mut stream = proxy.open("https://cdn.example/live.m3u8", None).unwrap();
    let handle = stream.handle();
    assert!(stream.next().await.unwrap().is_ok());

    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert!(stream.next().await.is_none());
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), handle.closed())
        .await
        .unwrap();
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(handle.end_reason(), Some(EndReason::Cancelled));
    assert_eq!(handle.end_signals(), 1);
    assert_eq!(handle.exit_status().unwrap().signal(), Some(9));
    assert_eq!(proxy.spawned(), 1);
}

#[tokio::test]
async fn failing_ffmpeg_ends_stream_with_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_ffmpeg(
        dir.path(),
        "for i in 1 2 3 4 5 6; do echo \"error line $i\" >&2; done\nexit 1",
    );
    let proxy = proxy(script);

    let mut stream = proxy.open("https://cdn.example/gone.mp4", None).unwrap();
    let handle = stream.handle();
    assert!(stream.next().await.is_none());
    handle.closed().await;

    assert_eq!(handle.end_signals(), 1);
    assert_eq!(handle.bytes_out(), 0);
    assert!(!handle.exit_status().unwrap().success());
    let tail = handle.stderr_tail();
    assert_eq!(tail.len(), 4);
    assert_eq!(tail.last().map(String::as_str), Some("error line 6"));
}

#[tokio::test]
async fn invalid_input_spawns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let script = fake_ffmpeg(dir.path(), &format!("touch '{}'", marker.display()));
    let proxy = proxy(script);

    let err = proxy.open("not-a-url", None).unwrap_err();
    assert!(matches!(err, TranscodeError::InvalidInput(_)));
    assert_eq!(proxy.spawned(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!marker.exists());
}
