//! Integration tests for buildplug.
//!
//! Cross-module scenarios over in-memory connections, and end-to-end runs
//! against the `buildplug-echo-plugin` binary launched as a real child
//! process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::duplex;
use tokio_util::sync::CancellationToken;

use buildplug::client::{PluginClient, PluginClientConfig, ShutdownCoordinator};
use buildplug::codec::MsgPackCodec;
use buildplug::component::{Artifact, Builder, Datasource};
use buildplug::discovery::{describe, ComponentRegistry, Discovery};
use buildplug::protocol::{build_frame, FrameBuffer, Header, PacketKind};
use buildplug::server::ComponentKind;
use buildplug::testing::{connected_pair, MockHook, MockUi};
use buildplug::{MuxConfig, MuxConn, MuxStream, PluginError, Role};

fn echo_plugin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_buildplug-echo-plugin"))
}

fn echo_client(component: &str, coordinator: &Arc<ShutdownCoordinator>) -> Arc<PluginClient> {
    let config = PluginClientConfig::new(echo_plugin())
        .args(["start", "builder", component])
        .managed(true)
        .start_timeout(Duration::from_secs(30));
    PluginClient::new(config, coordinator.clone())
}

async fn read_all(stream: &mut MuxStream) -> Vec<u8> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.read_chunk().await.unwrap() {
        data.extend_from_slice(&chunk);
    }
    data
}

async fn wait_for_say(ui: &MockUi, message: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !ui.said().iter().any(|m| m == message) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

/// Frame carrying a msgpack payload survives byte-by-byte delivery.
#[test]
fn test_fragmented_data_frame_with_msgpack_payload() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Payload {
        id: i32,
        message: String,
    }

    let payload = Payload {
        id: 42,
        message: "Hello, world!".to_string(),
    };
    let body = MsgPackCodec::encode(&payload).unwrap();
    let bytes = build_frame(&Header::new(7, PacketKind::Data, body.len() as u32), &body);

    let mut buffer = FrameBuffer::new();
    let mut frames = Vec::new();
    for byte in bytes {
        frames.extend(buffer.push(&[byte]).unwrap());
    }

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].stream_id(), 7);
    assert_eq!(frames[0].kind(), PacketKind::Data);
    let decoded: Payload = MsgPackCodec::decode(frames[0].payload()).unwrap();
    assert_eq!(decoded, payload);
}

/// Dozens of concurrently open streams each get back exactly their own data.
#[tokio::test]
async fn test_many_concurrent_streams_round_trip() {
    const STREAMS: usize = 48;
    let (client, server) = connected_pair();

    let mut tasks = Vec::new();
    for i in 0..STREAMS {
        let id = client.next_id().unwrap();
        let server = server.clone();
        tokio::spawn(async move {
            let mut stream = server.accept(id).await.unwrap();
            let mut data = read_all(&mut stream).await;
            data.reverse();
            stream.write_all(&data).await.unwrap();
            stream.close().await.unwrap();
        });

        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let payload: Vec<u8> = format!("stream-{i}-")
                .into_bytes()
                .into_iter()
                .cycle()
                .take(10_000 + i * 997)
                .collect();
            let mut stream = client.dial(id).await.unwrap();
            stream.write_all(&payload).await.unwrap();
            stream.close().await.unwrap();
            let echoed = read_all(&mut stream).await;
            (payload, echoed)
        }));
    }

    for task in tasks {
        let (mut payload, echoed) = task.await.unwrap();
        payload.reverse();
        assert_eq!(echoed, payload);
    }
}

/// A stream whose reader never reads stalls only itself.
#[tokio::test]
async fn test_slow_consumer_does_not_block_other_streams() {
    let config = MuxConfig {
        initial_window: 4096,
        ..MuxConfig::default()
    };
    let (a, b) = duplex(64 * 1024);
    let client = MuxConn::new(a, Role::Client, config.clone());
    let server = MuxConn::new(b, Role::Server, config);

    let stalled_id = client.next_id().unwrap();
    let live_id = client.next_id().unwrap();

    let stalled_server = server.clone();
    let _parked = tokio::spawn(async move {
        let stream = stalled_server.accept(stalled_id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });
    let mut stalled = client.dial(stalled_id).await.unwrap();
    let blocked_write = tokio::spawn(async move {
        stalled.write_all(&vec![0u8; 256 * 1024]).await
    });

    let live_server = server.clone();
    tokio::spawn(async move {
        let mut stream = live_server.accept(live_id).await.unwrap();
        let data = read_all(&mut stream).await;
        stream.write_all(&data).await.unwrap();
        stream.close().await.unwrap();
    });

    let round_trip = async {
        let mut live = client.dial(live_id).await.unwrap();
        live.write_all(b"still moving").await.unwrap();
        live.close().await.unwrap();
        read_all(&mut live).await
    };
    let echoed = tokio::time::timeout(Duration::from_secs(5), round_trip)
        .await
        .unwrap();
    assert_eq!(Bytes::from(echoed), Bytes::from_static(b"still moving"));
    assert!(!blocked_write.is_finished());
}

/// The echo plugin's builder calls back into our UI and returns artifact "x".
#[tokio::test]
async fn test_echo_plugin_end_to_end() {
    let coordinator = ShutdownCoordinator::new();
    let plugin = echo_client("default", &coordinator);
    assert_eq!(coordinator.managed_count(), 1);

    let builder = plugin.builder().await.unwrap();
    let ui = Arc::new(MockUi::default());
    let artifact = builder
        .run(
            CancellationToken::new(),
            ui.clone(),
            Arc::new(MockHook::default()),
        )
        .await
        .unwrap()
        .expect("echo builder returns an artifact");

    assert_eq!(ui.said(), vec!["hello"]);
    assert_eq!(artifact.id().await.unwrap(), "x");
    assert_eq!(artifact.builder_id().await.unwrap(), "buildplug.mock");

    let spec = builder.config_spec().await.unwrap().to_json().unwrap();
    assert_eq!(spec["greeting"], "string");

    coordinator.kill_all().await;
    assert!(coordinator.is_shutting_down());
}

/// Start is idempotent and shares one connection between proxies.
#[tokio::test]
async fn test_echo_plugin_start_twice() {
    let coordinator = ShutdownCoordinator::new();
    let plugin = echo_client("default", &coordinator);

    let first = plugin.start().await.unwrap();
    let second = plugin.start().await.unwrap();
    assert_eq!(first, second);

    let a = plugin.client().await.unwrap();
    let b = plugin.client().await.unwrap();
    assert_eq!(a.stream_id(), b.stream_id());

    plugin.kill().await;
    plugin.kill().await;
}

/// Cancelling the context reaches the plugin's running build.
#[tokio::test]
async fn test_cancel_reaches_plugin() {
    let coordinator = ShutdownCoordinator::new();
    let plugin = echo_client("blocking", &coordinator);
    let builder = plugin.builder().await.unwrap();

    let ui = Arc::new(MockUi::default());
    let ctx = CancellationToken::new();
    let run = {
        let (ui, ctx) = (ui.clone(), ctx.clone());
        tokio::spawn(async move { builder.run(ctx, ui, Arc::new(MockHook::default())).await })
    };
    wait_for_say(&ui, "running").await;
    ctx.cancel();

    let err = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "Builder.Run: build cancelled");
    assert!(!err.is_transport());

    coordinator.kill_all().await;
}

/// Connection loss caused by shutdown is expected and not fatal.
#[tokio::test]
async fn test_kill_during_call_is_absorbed() {
    let coordinator = ShutdownCoordinator::new();
    let plugin = echo_client("blocking", &coordinator);
    let builder = plugin.builder().await.unwrap();

    let ui = Arc::new(MockUi::default());
    let run = {
        let ui = ui.clone();
        tokio::spawn(async move {
            builder
                .run(CancellationToken::new(), ui, Arc::new(MockHook::default()))
                .await
        })
    };
    wait_for_say(&ui, "running").await;

    coordinator.kill_all().await;
    let err = run.await.unwrap().err().unwrap();
    assert!(err.is_transport());
    assert!(!err.is_fatal());
}

/// The plugin dying while no shutdown is underway is a fatal failure.
#[tokio::test]
async fn test_plugin_death_outside_shutdown_is_fatal() {
    let coordinator = ShutdownCoordinator::new();
    let plugin = echo_client("blocking", &coordinator);
    let builder = plugin.builder().await.unwrap();

    let ui = Arc::new(MockUi::default());
    let run = {
        let ui = ui.clone();
        tokio::spawn(async move {
            builder
                .run(CancellationToken::new(), ui, Arc::new(MockHook::default()))
                .await
        })
    };
    wait_for_say(&ui, "running").await;

    plugin.kill().await;
    let err = run.await.unwrap().err().unwrap();
    assert!(err.is_fatal());
    assert!(matches!(err.root(), PluginError::Transport { fatal: true, .. }));
    assert!(!coordinator.is_shutting_down());
}

/// `describe` lists every registered component.
#[tokio::test]
async fn test_echo_plugin_describe() {
    let description = describe(&echo_plugin()).await.unwrap();
    assert_eq!(description.api_version, "x5.0");
    assert_eq!(description.builders, vec!["blocking", "default"]);
    assert_eq!(description.provisioners, vec!["shell"]);
    assert_eq!(description.datasources, vec!["static"]);
    assert!(description.post_processors.is_empty());
}

/// Running the plugin by hand is refused.
#[tokio::test]
async fn test_echo_plugin_refuses_direct_start() {
    let output = tokio::process::Command::new(echo_plugin())
        .args(["start", "builder", "default"])
        .env_remove(buildplug::handshake::MAGIC_COOKIE_KEY)
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not meant to be executed directly"));
}

/// A copied multi-component binary is discovered and launchable by key.
#[tokio::test]
async fn test_discovered_plugin_runs() {
    let dir = tempfile::tempdir().unwrap();
    let binary = dir
        .path()
        .join(format!("buildplug-plugin-echo{}", std::env::consts::EXE_SUFFIX));
    std::fs::copy(echo_plugin(), &binary).unwrap();

    let coordinator = ShutdownCoordinator::new();
    let mut registry = ComponentRegistry::new();
    Discovery::new(coordinator.clone())
        .known_plugin_folders(Vec::new())
        .discover_dir(dir.path(), &mut registry)
        .await
        .unwrap();

    assert_eq!(
        registry.names(ComponentKind::Builder),
        vec!["echo", "echo-blocking"]
    );
    assert_eq!(registry.names(ComponentKind::Provisioner), vec!["echo-shell"]);
    assert_eq!(registry.names(ComponentKind::Datasource), vec!["echo-static"]);

    let builder = registry.builder("echo").await.unwrap();
    let ui = Arc::new(MockUi::default());
    let artifact = builder
        .run(
            CancellationToken::new(),
            ui.clone(),
            Arc::new(MockHook::default()),
        )
        .await
        .unwrap()
        .expect("artifact");
    assert_eq!(artifact.id().await.unwrap(), "x");

    let datasource = registry.datasource("echo-static").await.unwrap();
    datasource
        .configure(vec![serde_json::json!({ "channel": "beta" })])
        .await
        .unwrap();
    assert_eq!(
        datasource.execute().await.unwrap(),
        serde_json::json!({ "channel": "beta" })
    );

    assert_eq!(coordinator.managed_count(), 2);
    coordinator.kill_all().await;
}
