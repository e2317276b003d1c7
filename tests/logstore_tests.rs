//! Tests for the append-only output log and its reader fan-out.

use std::time::Duration;

use bytes::Bytes;
use procwarden::logstore::{log_buffer, LogReader};

async fn collect(mut reader: LogReader) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = reader.next_chunk().await {
        out.extend_from_slice(&chunk);
    }
    out
}

#[tokio::test]
async fn test_reader_sees_appends_in_order() {
    let (writer, handle) = log_buffer();
    writer.append(Bytes::from_static(b"one "));
    writer.append(Bytes::from_static(b"two "));
    writer.append(Bytes::from_static(b"three"));
    writer.close();

    let out = collect(handle.reader()).await;
    assert_eq!(out, b"one two three");
}

#[tokio::test]
async fn test_late_reader_replays_from_offset_zero() {
    let (writer, handle) = log_buffer();
    writer.append(Bytes::from_static(b"hello\n"));
    writer.close();
    assert!(handle.is_closed());

    // A reader opened after close still sees everything.
    let out = collect(handle.reader()).await;
    assert_eq!(out, b"hello\n");
}

#[tokio::test]
async fn test_caught_up_reader_blocks_until_append() {
    let (writer, handle) = log_buffer();
    let mut reader = handle.reader();

    // Nothing written yet: next_chunk suspends.
    let pending = tokio::time::timeout(Duration::from_millis(50), reader.next_chunk()).await;
    assert!(pending.is_err());

    writer.append(Bytes::from_static(b"x"));
    let chunk = tokio::time::timeout(Duration::from_secs(1), reader.next_chunk())
        .await
        .expect("reader woke up")
        .expect("chunk available");
    assert_eq!(&chunk[..], b"x");
}

#[tokio::test]
async fn test_close_wakes_blocked_readers() {
    let (writer, handle) = log_buffer();
    let mut reader = handle.reader();

    let waiter = tokio::spawn(async move { reader.next_chunk().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    writer.close();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter finished")
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_concurrent_readers_observe_identical_bytes() {
    let (writer, handle) = log_buffer();

    let early = tokio::spawn(collect(handle.reader()));

    let write_task = tokio::spawn(async move {
        for i in 0..100u32 {
            writer.append(Bytes::from(format!("line {i}\n")));
            if i % 10 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        writer.close();
    });

    // One reader joins mid-stream, one after the writer closed.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mid = tokio::spawn(collect(handle.reader()));
    write_task.await.unwrap();
    let late = collect(handle.reader()).await;

    let early = early.await.unwrap();
    let mid = mid.await.unwrap();
    let expected: Vec<u8> = (0..100u32)
        .flat_map(|i| format!("line {i}\n").into_bytes())
        .collect();
    assert_eq!(early, expected);
    assert_eq!(mid, expected);
    assert_eq!(late, expected);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (writer, handle) = log_buffer();
    writer.append(Bytes::from_static(b"data"));
    writer.close();
    writer.close();

    assert_eq!(handle.len(), 4);
    assert_eq!(collect(handle.reader()).await, b"data");
}

#[tokio::test]
async fn test_empty_appends_are_skipped() {
    let (writer, handle) = log_buffer();
    writer.append(Bytes::new());
    writer.append(Bytes::from_static(b"a"));
    writer.append(Bytes::new());
    writer.close();

    let mut reader = handle.reader();
    assert_eq!(&reader.next_chunk().await.unwrap()[..], b"a");
    assert!(reader.next_chunk().await.is_none());
}

#[tokio::test]
async fn test_slow_reader_does_not_block_writer_or_peers() {
    let (writer, handle) = log_buffer();
    let mut slow = handle.reader();

    for _ in 0..1000 {
        writer.append(Bytes::from_static(b"chunk"));
    }
    writer.close();

    // The slow reader took nothing yet; a fresh reader drains everything.
    let fast = collect(handle.reader()).await;
    assert_eq!(fast.len(), 5000);

    // And the slow reader still gets the full stream afterwards.
    let first = slow.next_chunk().await.unwrap();
    assert_eq!(&first[..], b"chunk");
}
