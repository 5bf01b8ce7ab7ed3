// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end tests against a minimal loopback indexer stub: a TCP server
//! that speaks just enough of the wire protocol (handshake, auth, tag
//! negotiation, entry receipt, sync ack) to exercise the Muxer's public API
//! without a real indexer.

use std::time::Duration;

use bytes::Bytes;
use ingest_mux::muxer::{CacheMode, Muxer, MuxerConfig};
use ingest_mux::wire::codec::{Frame, AUTH_REASON_BAD_SECRET, AUTH_REASON_OK};
use ingest_mux::wire::frame::{read_frame, write_frame};
use ingest_mux::wire::{Entry, MAX_FRAME_PAYLOAD};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const SECRET: &str = "loopback-secret";

/// Runs the server side of one Connection: handshake, auth, then forwards
/// every received Entry/Batch onto `received` and acks SYNC/NEG_TAG/PING.
async fn serve_one_connection(mut stream: TcpStream, accept_auth: bool, received: mpsc::UnboundedSender<Entry>) {
    let (hdr, payload) = read_frame(&mut stream, MAX_FRAME_PAYLOAD).await.unwrap();
    let Frame::Handshake { .. } = Frame::decode(hdr.id, payload).unwrap() else {
        panic!("expected HANDSHAKE first");
    };

    let (hdr, payload) = read_frame(&mut stream, MAX_FRAME_PAYLOAD).await.unwrap();
    let Frame::Auth { secret } = Frame::decode(hdr.id, payload).unwrap() else {
        panic!("expected AUTH second");
    };

    let ok = accept_auth && secret.as_ref() == SECRET.as_bytes();
    let resp = Frame::AuthResp { ok, reason: if ok { AUTH_REASON_OK } else { AUTH_REASON_BAD_SECRET } };
    write_frame(&mut stream, resp.command_id(), &resp.encode_payload()).await.unwrap();
    if !ok {
        return;
    }

    let mut next_tag_id: u16 = 1;
    loop {
        let (hdr, payload) = match read_frame(&mut stream, MAX_FRAME_PAYLOAD).await {
            Ok(v) => v,
            Err(_) => return,
        };
        let Ok(frame) = Frame::decode(hdr.id, payload) else { return };
        match frame {
            Frame::NegTag { .. } => {
                let resp = Frame::NegTagResp { tag_id: next_tag_id, ok: true };
                next_tag_id += 1;
                write_frame(&mut stream, resp.command_id(), &resp.encode_payload()).await.unwrap();
            }
            Frame::Entry { entry } => {
                let _ = received.send(entry);
            }
            Frame::Batch { entries } => {
                for e in entries {
                    let _ = received.send(e);
                }
            }
            Frame::Sync { cursor } => {
                let resp = Frame::SyncAck { cursor, ok: true };
                write_frame(&mut stream, resp.command_id(), &resp.encode_payload()).await.unwrap();
            }
            Frame::Ping => {
                write_frame(&mut stream, Frame::Pong.command_id(), &Frame::Pong.encode_payload()).await.unwrap();
            }
            Frame::State { .. } => {}
            other => panic!("unexpected frame from client: {other:?}"),
        }
    }
}

async fn spawn_indexer(accept_auth: bool) -> (String, mpsc::UnboundedReceiver<Entry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            serve_one_connection(stream, accept_auth, tx.clone()).await;
        }
    });
    (format!("tcp://{addr}"), rx)
}

fn base_cfg(destination: String) -> MuxerConfig {
    let yaml = format!(
        r#"
destinations:
  - "{destination}"
auth: "{SECRET}"
ingester_name: "loopback-test"
connection_timeout: 2
dial_timeout: 2
keepalive_interval: 60
keepalive_timeout: 120
"#
    );
    serde_yaml::from_str(&yaml).unwrap()
}

#[tokio::test]
async fn writes_an_entry_to_a_hot_connection() {
    let (destination, mut received) = spawn_indexer(true).await;
    let muxer = Muxer::start(base_cfg(destination)).unwrap();

    muxer.wait_for_hot(Duration::from_secs(5)).await.unwrap();

    let tag = muxer.tag_manager().negotiate("t1").unwrap();
    let entry = Entry::new(1_700_000_000, 0, tag, Bytes::from_static(b"hello-indexer"));
    muxer.write_entry(entry.clone()).await.unwrap();
    muxer.sync(Duration::from_secs(5)).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(got.data, entry.data);

    muxer.close(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn write_batch_delivers_every_entry_in_order() {
    let (destination, mut received) = spawn_indexer(true).await;
    let muxer = Muxer::start(base_cfg(destination)).unwrap();
    muxer.wait_for_hot(Duration::from_secs(5)).await.unwrap();

    let tag = muxer.tag_manager().negotiate("t1").unwrap();
    let entries: Vec<Entry> = (0..5).map(|i| Entry::new(i, 0, tag, Bytes::from(format!("e{i}")))).collect();
    muxer.write_batch(entries.clone()).await.unwrap();
    muxer.sync(Duration::from_secs(5)).await.unwrap();

    for expected in &entries {
        let got = tokio::time::timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
        assert_eq!(got.data, expected.data);
    }

    muxer.close(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn auth_rejection_keeps_the_connection_out_of_the_hot_set() {
    let (destination, _received) = spawn_indexer(false).await;
    let muxer = Muxer::start(base_cfg(destination)).unwrap();

    let result = muxer.wait_for_hot(Duration::from_millis(500)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn cache_fallback_holds_entries_until_a_connection_turns_hot() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_cfg("tcp://127.0.0.1:1".to_string());
    cfg.cache_enabled = true;
    cfg.cache_mode = CacheMode::Fallback;
    cfg.cache_path = dir.path().to_str().unwrap().to_string();
    cfg.connection_timeout = Duration::from_millis(200);
    // Unroutable target: the Connection stays Dead until we swap in a real
    // listener below, exercising the Cache fallback path immediately.

    let muxer = Muxer::start(cfg).unwrap();
    let entry = Entry::new(1, 0, 0, Bytes::from_static(b"queued-while-cold"));
    muxer.write_entry(entry.clone()).await.unwrap();
    assert!(muxer.cache_size() > 0);
}
