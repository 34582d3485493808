//! Integration tests for the Starling mesh
//!
//! Multi-node scenarios over in-memory links and loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use starling_core::connection::tcp::TcpConnector;
use starling_core::message::{ErrorKind, KillSwitch, NodeKind, SyncRequest, TerminateKind};
use starling_core::{Error, MessageType, Node, NodeConfig, NodeId, StreamBinding, StreamKind};
use starling_crypto::FrameKey;
use starling_crypto::hash::derive_frame_key;
use starling_integration_tests::fixtures::{CaptureSink, MeshFixture, Recorder, SlowLink};
use starling_integration_tests::test_helpers::{eventually, quiesce};

use NodeKind::{Agent, Terminal};

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_broadcast_reaches_every_node_once_in_a_cycle() {
    let mesh = MeshFixture::ring(&[Terminal, Agent, Agent, Agent, Agent]);
    mesh.wait_for_routes().await;

    let kill = KillSwitch {
        reason: "cycle".into(),
    };
    mesh.node(0)
        .send_payload(NodeId::BROADCAST, &kill)
        .unwrap();

    let everyone = || (1..5).all(|i| mesh.recorder(i).count(MessageType::KillSwitch) == 1);
    assert!(eventually(everyone).await);
    quiesce().await;
    for i in 1..5 {
        assert_eq!(mesh.recorder(i).count(MessageType::KillSwitch), 1, "node {i}");
    }
    // The originator never processes its own broadcast
    assert_eq!(mesh.recorder(0).count(MessageType::KillSwitch), 0);
}

#[tokio::test]
async fn test_targeted_message_relayed_along_a_line() {
    let mesh = MeshFixture::line(&[Terminal, Agent, Agent, Agent]);
    mesh.wait_for_full_routes(0).await;

    mesh.node(0).send_payload(mesh.id(3), &SyncRequest).unwrap();

    assert!(eventually(|| mesh.recorder(3).count(MessageType::SyncRequest) == 1).await);
    quiesce().await;
    // Relays forward without processing
    assert_eq!(mesh.recorder(1).count(MessageType::SyncRequest), 0);
    assert_eq!(mesh.recorder(2).count(MessageType::SyncRequest), 0);
    let received = &mesh.recorder(3).of_kind(MessageType::SyncRequest)[0];
    assert_eq!(received.source, mesh.id(0));
}

#[tokio::test]
async fn test_hello_teaches_routes_across_the_mesh() {
    let mesh = MeshFixture::line(&[Terminal, Agent, Agent]);
    mesh.wait_for_full_routes(0).await;
    mesh.wait_for_full_routes(2).await;

    // Both of node 0's routes go through its only link
    let via = mesh.node(0).route_to(mesh.id(1));
    assert_eq!(mesh.node(0).route_to(mesh.id(2)), via);
    assert!(mesh.recorder(0).count(MessageType::Hello) >= 2);
}

#[tokio::test]
async fn test_route_heals_after_link_loss() {
    // 0 - 1 - 2 and 0 - 3 - 2
    let mesh = MeshFixture::new(&[Terminal, Agent, Agent, Agent]);
    mesh.link(0, 1);
    mesh.link(1, 2);
    mesh.link(0, 3);
    mesh.link(3, 2);
    mesh.wait_for_routes().await;
    mesh.wait_for_full_routes(0).await;

    let via = mesh.node(0).route_to(mesh.id(2)).unwrap();
    let index = mesh.connection_index(0, via).unwrap();
    mesh.node(0).terminate(TerminateKind::Connection, index).unwrap();
    assert!(eventually(|| mesh.node(0).connection_count() == 1).await);
    assert_ne!(mesh.node(0).route_to(mesh.id(2)), Some(via));

    mesh.node(0).send_payload(mesh.id(2), &SyncRequest).unwrap();
    assert!(eventually(|| mesh.recorder(2).count(MessageType::SyncRequest) == 1).await);
}

#[tokio::test]
async fn test_connection_loss_reported_to_the_mesh() {
    let mesh = MeshFixture::line(&[Terminal, Agent, Agent]);
    mesh.wait_for_full_routes(0).await;

    let via = mesh.node(2).route_to(mesh.id(1)).unwrap();
    let index = mesh.connection_index(2, via).unwrap();
    mesh.node(2).terminate(TerminateKind::Connection, index).unwrap();

    // Node 1 sees its link to 2 drop and tells the operator
    assert!(eventually(|| mesh.recorder(0).has_report(ErrorKind::ConnectionLost)).await);
    let (source, _) = mesh
        .recorder(0)
        .reports()
        .into_iter()
        .find(|(_, report)| report.kind == ErrorKind::ConnectionLost)
        .unwrap();
    assert_eq!(source, mesh.id(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relay_only_dedup_still_delivers_streams() {
    let config = NodeConfig {
        stream_dedup: starling_core::StreamDedupPolicy::RelayOnly,
        ..NodeConfig::default()
    };
    let mesh = MeshFixture::with_config(&[Terminal, Agent, Agent], config);
    mesh.link(0, 1);
    mesh.link(1, 2);
    mesh.wait_for_full_routes(0).await;

    let sink = Arc::new(CaptureSink::default());
    mesh.node(0)
        .open_stream(
            mesh.id(2),
            StreamKind::Command,
            "echo relayed",
            StreamBinding::Sink(sink.clone()),
        )
        .await
        .unwrap();
    assert!(eventually(|| sink.closed_count() == 1).await);
    assert_eq!(sink.bytes(), b"relayed\n");
}

// ============================================================================
// Circuits
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_command_output_returns_to_the_opener() {
    let mesh = MeshFixture::line(&[Terminal, Agent]);
    mesh.wait_for_routes().await;

    let sink = Arc::new(CaptureSink::default());
    let handle = mesh
        .node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::Command,
            "echo hi",
            StreamBinding::Sink(sink.clone()),
        )
        .await
        .unwrap();

    assert!(eventually(|| sink.closed_count() == 1).await);
    assert_eq!(sink.bytes(), b"hi\n");
    assert!(handle.is_closed());
    assert!(eventually(|| mesh.recorder(0).has_report(ErrorKind::CommandEnded)).await);
    assert!(eventually(|| mesh.node(1).stream_count() == 0).await);
    assert_eq!(mesh.node(0).stream_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_chunk_echo_through_a_relay() {
    let mesh = MeshFixture::line(&[Terminal, Agent, Agent]);
    mesh.wait_for_full_routes(0).await;

    let sink = Arc::new(CaptureSink::default());
    let handle = mesh
        .node(0)
        .open_stream(
            mesh.id(2),
            StreamKind::Command,
            "cat",
            StreamBinding::Sink(sink.clone()),
        )
        .await
        .unwrap();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    handle.write(&payload).await.unwrap();
    handle.flush().await.unwrap();

    assert!(eventually(|| sink.bytes().len() == payload.len()).await);
    assert_eq!(sink.bytes(), payload);

    assert!(handle.close().await);
    assert!(eventually(|| mesh.node(2).stream_count() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_is_idempotent() {
    let mesh = MeshFixture::line(&[Terminal, Agent]);
    mesh.wait_for_routes().await;

    let sink = Arc::new(CaptureSink::default());
    let handle = mesh
        .node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::Command,
            "cat",
            StreamBinding::Sink(sink.clone()),
        )
        .await
        .unwrap();
    assert!(eventually(|| mesh.node(1).stream_count() == 1).await);

    assert!(handle.close().await);
    assert!(!handle.close().await);
    assert!(!handle.abort());
    assert!(eventually(|| mesh.node(1).stream_count() == 0).await);
    quiesce().await;
    assert_eq!(sink.closed_count(), 1);
    assert!(matches!(
        handle.write(b"late").await,
        Err(Error::StreamClosed(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delayed_link_keeps_one_chunk_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("slow.bin");
    let config = NodeConfig {
        stream_chunk_size: 4096,
        ..NodeConfig::default()
    };
    let mesh = MeshFixture::with_config(&[Terminal, Agent], config);
    let log = SlowLink::connect(mesh.node(0), mesh.node(1), Duration::from_millis(5));
    mesh.wait_for_full_routes(0).await;

    let handle = mesh
        .node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::FileUpload,
            target.to_string_lossy(),
            StreamBinding::Detached,
        )
        .await
        .unwrap();
    let contents: Vec<u8> = (0..40_000u32).map(|i| (i % 199) as u8).collect();
    handle.write(&contents).await.unwrap();
    assert!(handle.close().await);

    assert!(eventually(|| mesh.recorder(0).has_report(ErrorKind::FileUploadCompleted)).await);
    assert_eq!(std::fs::read(&target).unwrap(), contents);

    let kinds = log.kinds();
    let chunks = kinds.iter().filter(|k| **k == MessageType::StreamData).count();
    assert_eq!(chunks, contents.len().div_ceil(handle.chunk_size()));
    // Each chunk is acknowledged before the next one leaves
    for pair in kinds.windows(2) {
        let back_to_back =
            pair[0] == MessageType::StreamData && pair[1] == MessageType::StreamData;
        assert!(!back_to_back, "{kinds:?}");
    }
    // and the close only follows the last acknowledgement
    let close = kinds
        .iter()
        .position(|k| *k == MessageType::StreamClose)
        .unwrap();
    assert_eq!(kinds[close - 1], MessageType::StreamAck);
    assert_eq!(
        kinds.iter().filter(|k| **k == MessageType::StreamClose).count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_both_ends_closing_at_once_send_one_close_each() {
    let mesh = MeshFixture::new(&[Terminal, Agent]);
    let log = SlowLink::connect(mesh.node(0), mesh.node(1), Duration::from_millis(5));
    mesh.wait_for_full_routes(0).await;

    let sink = Arc::new(CaptureSink::default());
    let handle = mesh
        .node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::Command,
            "cat",
            StreamBinding::Sink(sink.clone()),
        )
        .await
        .unwrap();
    assert!(eventually(|| mesh.node(1).stream_count() == 1).await);
    let index = mesh.node(1).info().snapshot().streams[0].index;

    let agent = mesh.node(1).clone();
    let far = tokio::spawn(async move { agent.terminate(TerminateKind::Stream, index) });
    let near = handle.abort();
    // The far end may already have seen our close and dropped the circuit
    let _ = far.await.unwrap();
    assert!(near);

    assert!(eventually(|| mesh.node(1).stream_count() == 0).await);
    assert_eq!(mesh.node(0).stream_count(), 0);
    quiesce().await;

    let closes_from = |node: NodeId| {
        log.events()
            .into_iter()
            .filter(|(sender, kind)| *sender == node && *kind == MessageType::StreamClose)
            .count()
    };
    assert_eq!(closes_from(mesh.id(0)), 1);
    assert!(closes_from(mesh.id(1)) <= 1);
    assert_eq!(sink.closed_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsupported_stream_kind_closes_immediately() {
    let mesh = MeshFixture::line(&[Terminal, Agent]);
    mesh.wait_for_routes().await;

    let sink = Arc::new(CaptureSink::default());
    // The mirror may ack before closing, so either outcome of open is fine
    let _ = mesh
        .node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::Socks5,
            "10.0.0.1:1080",
            StreamBinding::Sink(sink.clone()),
        )
        .await;

    assert!(eventually(|| sink.closed_count() == 1).await);
    let reported = || mesh.recorder(0).has_report(ErrorKind::UnsupportedStreamType);
    assert!(eventually(reported).await);
    assert_eq!(mesh.node(0).stream_count(), 0);
    assert!(eventually(|| mesh.node(1).stream_count() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_streams_through_a_lost_link_are_closed() {
    let mesh = MeshFixture::line(&[Terminal, Agent, Agent]);
    mesh.wait_for_full_routes(0).await;

    let sink = Arc::new(CaptureSink::default());
    let handle = mesh
        .node(0)
        .open_stream(
            mesh.id(2),
            StreamKind::Command,
            "cat",
            StreamBinding::Sink(sink.clone()),
        )
        .await
        .unwrap();

    let via = mesh.node(0).route_to(mesh.id(1)).unwrap();
    let index = mesh.connection_index(0, via).unwrap();
    mesh.node(0).terminate(TerminateKind::Connection, index).unwrap();

    assert!(eventually(|| handle.is_closed()).await);
    assert_eq!(sink.closed_count(), 1);
    assert!(mesh.node(0).route_to(mesh.id(2)).is_none());
}

// ============================================================================
// File circuits
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upload_writes_a_new_file() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("uploaded.bin");
    let mesh = MeshFixture::line(&[Terminal, Agent]);
    mesh.wait_for_routes().await;

    let handle = mesh
        .node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::FileUpload,
            target.to_string_lossy(),
            StreamBinding::Detached,
        )
        .await
        .unwrap();
    let contents: Vec<u8> = (0..150_000u32).map(|i| (i * 7) as u8).collect();
    handle.write(&contents).await.unwrap();
    handle.flush().await.unwrap();
    assert!(handle.close().await);

    let reported = || mesh.recorder(0).has_report(ErrorKind::FileUploadCompleted);
    assert!(eventually(reported).await);
    assert_eq!(std::fs::read(&target).unwrap(), contents);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_right_after_write_keeps_every_upload_byte() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = MeshFixture::line(&[Terminal, Agent, Agent]);
    mesh.wait_for_full_routes(0).await;
    let contents: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();

    for round in 0..8 {
        let name = format!("round-{round}.bin");
        let target = dir.path().join(&name);
        let handle = mesh
            .node(0)
            .open_stream(
                mesh.id(2),
                StreamKind::FileUpload,
                target.to_string_lossy(),
                StreamBinding::Detached,
            )
            .await
            .unwrap();

        // No flush: close itself waits for the last chunk's ack
        handle.write(&contents).await.unwrap();
        assert!(handle.close().await);

        let completed = || {
            mesh.recorder(0).reports().iter().any(|(_, report)| {
                report.kind == ErrorKind::FileUploadCompleted && report.context.contains(&name)
            })
        };
        assert!(eventually(completed).await, "round {round}");
        assert_eq!(std::fs::read(&target).unwrap(), contents, "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upload_never_replaces_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("existing.txt");
    std::fs::write(&target, b"keep me").unwrap();
    let mesh = MeshFixture::line(&[Terminal, Agent]);
    mesh.wait_for_routes().await;

    let _ = mesh
        .node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::FileUpload,
            target.to_string_lossy(),
            StreamBinding::Detached,
        )
        .await;

    assert!(eventually(|| mesh.recorder(0).has_report(ErrorKind::FileOpenFailed)).await);
    assert!(eventually(|| mesh.node(0).stream_count() == 0).await);
    assert_eq!(std::fs::read(&target).unwrap(), b"keep me");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_streams_the_file_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    let contents: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();
    std::fs::write(&source, &contents).unwrap();
    let mesh = MeshFixture::line(&[Terminal, Agent]);
    mesh.wait_for_routes().await;

    let sink = Arc::new(CaptureSink::default());
    mesh.node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::FileDownload,
            source.to_string_lossy(),
            StreamBinding::Sink(sink.clone()),
        )
        .await
        .unwrap();

    assert!(eventually(|| sink.closed_count() == 1).await);
    assert_eq!(sink.bytes(), contents);
    let reported = || mesh.recorder(0).has_report(ErrorKind::FileDownloadCompleted);
    assert!(eventually(reported).await);
}

// ============================================================================
// Termination
// ============================================================================

#[tokio::test]
async fn test_terminate_by_index() {
    let mesh = MeshFixture::line(&[Terminal, Agent]);
    mesh.wait_for_routes().await;
    let agent = mesh.node(1);

    let binding = TcpConnector::new("127.0.0.1:0", None).bind(agent).unwrap();
    let serving = tokio::spawn(binding.serve());
    assert!(eventually(|| mesh.recorder(0).count(MessageType::NewBind) == 1).await);

    let snapshot = agent.info().snapshot();
    let index = snapshot.listeners[0].index;
    agent.terminate(TerminateKind::Listener, index).unwrap();
    serving.await.unwrap().unwrap();
    assert_eq!(agent.listener_count(), 0);
    assert!(eventually(|| mesh.recorder(0).has_report(ErrorKind::BindDropped)).await);

    assert!(matches!(
        agent.terminate(TerminateKind::Stream, 7),
        Err(Error::InvalidIndex(7))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agent_shutdown_closes_everything() {
    let mesh = MeshFixture::line(&[Terminal, Agent]);
    mesh.wait_for_routes().await;

    let sink = Arc::new(CaptureSink::default());
    let handle = mesh
        .node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::Command,
            "cat",
            StreamBinding::Sink(sink.clone()),
        )
        .await
        .unwrap();

    mesh.node(1).terminate(TerminateKind::Agent, 0).unwrap();
    assert!(mesh.node(1).is_shut_down());
    assert_eq!(mesh.node(1).stream_count(), 0);

    assert!(eventually(|| handle.is_closed()).await);
    assert!(eventually(|| mesh.recorder(0).has_report(ErrorKind::AgentExitSignal)).await);
    assert!(eventually(|| mesh.node(0).connection_count() == 0).await);
}

// ============================================================================
// TCP transport
// ============================================================================

async fn tcp_pair(
    server_key: Option<FrameKey>,
    client_key: Option<FrameKey>,
) -> (Node, Node, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let server = Node::builder(Agent).processor(recorder.clone()).build();
    let client = Node::new(Terminal);

    let binding = TcpConnector::new("127.0.0.1:0", server_key).bind(&server).unwrap();
    let addr = binding.local_addr().to_string();
    tokio::spawn(binding.serve());
    TcpConnector::new(addr, client_key).dial(&client).await.unwrap();
    (server, client, recorder)
}

#[tokio::test]
async fn test_sealed_tcp_link_carries_messages() {
    let key = derive_frame_key(b"shared secret").unwrap();
    let (server, client, recorder) = tcp_pair(Some(key.clone()), Some(key)).await;

    assert!(eventually(|| client.route_to(server.id()).is_some()).await);
    client.send_payload(server.id(), &SyncRequest).unwrap();
    assert!(eventually(|| recorder.count(MessageType::SyncRequest) == 1).await);

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn test_mismatched_keys_never_link() {
    let (server, client, recorder) = tcp_pair(
        Some(derive_frame_key(b"one").unwrap()),
        Some(derive_frame_key(b"two").unwrap()),
    )
    .await;

    let dropped = || client.connection_count() == 0 && server.connection_count() == 0;
    assert!(eventually(dropped).await);
    assert!(client.route_to(server.id()).is_none());
    assert_eq!(recorder.count(MessageType::Hello), 0);

    server.shutdown();
    client.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_port_forward_bridges_a_socket() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();
        // Dropping the socket ends the forward
    });

    let mesh = MeshFixture::line(&[Terminal, Agent]);
    mesh.wait_for_routes().await;
    let sink = Arc::new(CaptureSink::default());
    let handle = mesh
        .node(0)
        .open_stream(
            mesh.id(1),
            StreamKind::PortForward,
            echo_addr,
            StreamBinding::Sink(sink.clone()),
        )
        .await
        .unwrap();

    handle.write(b"hello").await.unwrap();
    assert!(eventually(|| sink.closed_count() == 1).await);
    assert_eq!(sink.bytes(), b"hello");
}
