//! Client Integration Tests
//!
//! Runs the dispatcher against real device servers on loopback addresses.
//! Both sides use scripted usbip runners, so the tests check:
//! - Multi-host list/find with skipped and unreachable hosts
//! - Attach ordering: server bind first, then local import
//! - Detach ordering: local release first, then server unbind
//! - Ambiguity and not-attached reporting
//!
//! Run with: `cargo test -p client --test integration_tests`

use client::{ClientError, Dispatcher, HostEntry};
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, EMPTY_PORT_OUTPUT, MockRunner, SAMPLE_LIST_OUTPUT, with_timeout,
};
use common::{CommandOutput, UsbipSettings, UsbipTool};
use protocol::DeviceRequest;
use server::{CommandServer, DeviceRegistry};
use std::sync::Arc;
use tempfile::TempDir;

struct TestServer {
    runner: Arc<MockRunner>,
    _sysfs: TempDir,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

/// Two identical Picos on one server
const TWIN_PICO_LIST_OUTPUT: &str = "\
 - busid 1-1.1 (2e8a:000a)
   Raspberry Pi : unknown product (2e8a:000a)

 - busid 1-1.2 (2e8a:000a)
   Raspberry Pi : unknown product (2e8a:000a)

";

/// Start a server on `ip:port`; port 0 picks a free one
async fn start_server(ip: &str, port: u16) -> (TestServer, u16) {
    start_server_with(ip, port, SAMPLE_LIST_OUTPUT).await
}

async fn start_server_with(ip: &str, port: u16, list_output: &str) -> (TestServer, u16) {
    let runner = Arc::new(MockRunner::new());
    runner.push_output("list", CommandOutput::ok(list_output));

    let sysfs = tempfile::tempdir().unwrap();
    let tool = UsbipTool::new(UsbipSettings::default(), runner.clone());
    let registry = Arc::new(DeviceRegistry::new(tool, sysfs.path()));
    let server = CommandServer::bind(&format!("{}:{}", ip, port), registry, DEFAULT_TEST_TIMEOUT)
        .await
        .expect("Failed to bind test server");
    let port = server.local_addr().unwrap().port();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));

    let server = TestServer {
        runner,
        _sysfs: sysfs,
        _shutdown: tx,
    };
    (server, port)
}

fn dispatcher(hosts: &[&str], port: u16, local: &Arc<MockRunner>) -> Dispatcher {
    let hosts = hosts.iter().map(|h| HostEntry::unprobed(*h)).collect();
    let tool = UsbipTool::new(UsbipSettings::default(), local.clone());
    Dispatcher::new(hosts, port, DEFAULT_TEST_TIMEOUT, tool)
}

fn port_output(server: &str, bus_id: &str) -> String {
    format!(
        "Imported USB devices\n====================\n\
         Port 02: <Port in Use> at Full Speed(12Mbps)\n       \
         Raspberry Pi : unknown product (2e8a:000a)\n       \
         3-3 -> usbip://{}:3240/{}\n           \
         -> remote bus/dev 001/004\n",
        server, bus_id
    )
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

// ============================================================================
// List / Find Tests
// ============================================================================

#[tokio::test]
async fn test_list_single_host() {
    let (server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, dispatcher.list())
        .await
        .unwrap();

    let buses: Vec<_> = outcome.devices.iter().map(|d| d.device.bus_id.as_str()).collect();
    assert_eq!(buses, vec!["1-1.1", "1-1.2"]);
    assert!(outcome.devices.iter().all(|d| d.host == "127.0.0.1"));
    assert!(outcome.skipped.is_empty());
    assert_eq!(server.runner.calls_for("list").len(), 1);
    assert!(local.calls().is_empty());
}

#[tokio::test]
async fn test_list_skips_unreachable_host() {
    let (_server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.3", "127.0.0.1"], port, &local);

    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, dispatcher.list())
        .await
        .unwrap();

    assert_eq!(outcome.devices.len(), 2);
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].0, "127.0.0.3");
    assert!(matches!(
        outcome.skipped[0].1,
        ClientError::Connectivity { .. }
    ));
}

#[tokio::test]
async fn test_list_all_hosts_failed() {
    let (_server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.3", "127.0.0.4"], port, &local);

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, dispatcher.list()).await;
    assert!(matches!(
        result,
        Err(ClientError::AllHostsFailed { count: 2 })
    ));
}

#[tokio::test]
async fn test_find_first_match() {
    let (_server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.3", "127.0.0.1"], port, &local);

    let found = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.find(&DeviceRequest::by_id("0403:6001")),
    )
    .await
    .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].host, "127.0.0.1");
    assert_eq!(found[0].device.bus_id, "1-1.2");
}

#[tokio::test]
async fn test_find_not_found_anywhere() {
    let (_server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let result = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.find(&DeviceRequest::by_id("ffff:ffff")),
    )
    .await;
    assert!(matches!(result, Err(ClientError::NotFoundAnywhere)));
}

#[tokio::test]
async fn test_find_all_reports_each_host() {
    let (_first, port) = start_server("127.0.0.1", 0).await;
    let (_second, _) = start_server("127.0.0.2", port).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.1", "127.0.0.2"], port, &local);

    let filter = DeviceRequest {
        first: false,
        ..DeviceRequest::by_id("2e8a:000a")
    };
    let found = with_timeout(DEFAULT_TEST_TIMEOUT, dispatcher.find(&filter))
        .await
        .unwrap();

    let hosts: Vec<_> = found.iter().map(|d| d.host.as_str()).collect();
    assert_eq!(hosts, vec!["127.0.0.1", "127.0.0.2"]);
}

// ============================================================================
// Attach Tests
// ============================================================================

#[tokio::test]
async fn test_attach_binds_then_imports() {
    let (server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let attached = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.attach(&DeviceRequest::by_id("2e8a:000a")),
    )
    .await
    .unwrap();

    assert_eq!(attached.host, "127.0.0.1");
    assert_eq!(attached.device.bus_id, "1-1.1");
    assert_eq!(
        server.runner.calls_for("bind"),
        vec![strings(&["sudo", "usbip", "bind", "-b", "1-1.1"])]
    );
    assert_eq!(
        local.calls_for("attach"),
        vec![strings(&["sudo", "usbip", "attach", "-r", "127.0.0.1", "-b", "1-1.1"])]
    );
}

#[tokio::test]
async fn test_attach_local_failure_is_inconsistent() {
    let (server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    local.push_output("attach", CommandOutput::failed(1, "usbip: error: import device"));
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let result = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.attach(&DeviceRequest::by_id("2e8a:000a")),
    )
    .await;

    match result {
        Err(ClientError::StateInconsistency { host, bus_id, .. }) => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(bus_id, "1-1.1");
        }
        other => panic!("Expected StateInconsistency, got {:?}", other),
    }
    assert_eq!(server.runner.calls_for("bind").len(), 1);
}

#[tokio::test]
async fn test_attach_unknown_device_never_imports() {
    let (server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let result = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.attach(&DeviceRequest::by_id("ffff:ffff")),
    )
    .await;

    assert!(matches!(result, Err(ClientError::NotFoundAnywhere)));
    assert!(server.runner.calls_for("bind").is_empty());
    assert!(local.calls_for("attach").is_empty());
}

#[tokio::test]
async fn test_attach_server_bind_failure_is_reported() {
    let (server, port) = start_server("127.0.0.1", 0).await;
    server
        .runner
        .push_output("bind", CommandOutput::failed(1, "usbip: error: bind device"));
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let result = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.attach(&DeviceRequest::by_id("2e8a:000a")),
    )
    .await;

    assert!(matches!(result, Err(ClientError::Server { .. })));
    assert!(local.calls_for("attach").is_empty());
}

#[tokio::test]
async fn test_attach_unique_rejects_ambiguous_match() {
    let (first, port) = start_server("127.0.0.1", 0).await;
    let (second, _) = start_server("127.0.0.2", port).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.1", "127.0.0.2"], port, &local);

    let filter = DeviceRequest {
        first: false,
        ..DeviceRequest::by_id("2e8a:000a")
    };
    let result = with_timeout(DEFAULT_TEST_TIMEOUT, dispatcher.attach(&filter)).await;

    match result {
        Err(ClientError::Ambiguous(candidates)) => {
            let hosts: Vec<_> = candidates.iter().map(|c| c.host.as_str()).collect();
            assert_eq!(hosts, vec!["127.0.0.1", "127.0.0.2"]);
        }
        other => panic!("Expected Ambiguous, got {:?}", other),
    }
    assert!(first.runner.calls_for("bind").is_empty());
    assert!(second.runner.calls_for("bind").is_empty());
    assert!(local.calls_for("attach").is_empty());
}

#[tokio::test]
async fn test_attach_unique_single_match() {
    let (server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    let dispatcher = dispatcher(&["127.0.0.1", "127.0.0.3"], port, &local);

    let filter = DeviceRequest {
        first: false,
        ..DeviceRequest::by_id("0403:6001")
    };
    let attached = with_timeout(DEFAULT_TEST_TIMEOUT, dispatcher.attach(&filter))
        .await
        .unwrap();

    assert_eq!(attached.device.bus_id, "1-1.2");
    assert_eq!(server.runner.calls_for("bind").len(), 1);
    assert_eq!(local.calls_for("attach").len(), 1);
}

// ============================================================================
// Detach Tests
// ============================================================================

#[tokio::test]
async fn test_detach_releases_port_then_unbinds() {
    let (server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    local.push_output("port", CommandOutput::ok(port_output("127.0.0.1", "1-1.1")));
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let detached = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.detach(&DeviceRequest::by_id("2e8a:000a")),
    )
    .await
    .unwrap();

    assert_eq!(detached.port, 2);
    assert_eq!(detached.device.device.bus_id, "1-1.1");
    assert_eq!(
        local.calls_for("detach"),
        vec![strings(&["sudo", "usbip", "detach", "-p", "2"])]
    );

    // Not bound in sysfs, so the server has nothing to unbind but still answers
    assert!(server.runner.calls_for("unbind").is_empty());
    assert!(server.runner.calls_for("list").len() >= 2);
}

#[tokio::test]
async fn test_detach_finds_attached_twin() {
    let (server, port) = start_server_with("127.0.0.1", 0, TWIN_PICO_LIST_OUTPUT).await;
    let local = Arc::new(MockRunner::new());
    local.push_output("port", CommandOutput::ok(port_output("127.0.0.1", "1-1.2")));
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let detached = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.detach(&DeviceRequest::by_id("2e8a:000a")),
    )
    .await
    .unwrap();

    assert_eq!(detached.port, 2);
    assert_eq!(detached.device.device.bus_id, "1-1.2");
    assert_eq!(
        local.calls_for("detach"),
        vec![strings(&["sudo", "usbip", "detach", "-p", "2"])]
    );
    assert!(server.runner.calls_for("unbind").is_empty());
}

#[tokio::test]
async fn test_detach_not_attached() {
    let (_server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    local.push_output("port", CommandOutput::ok(EMPTY_PORT_OUTPUT));
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let result = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.detach(&DeviceRequest::by_id("2e8a:000a")),
    )
    .await;

    match result {
        Err(ClientError::NotAttached { host, bus_id }) => {
            assert_eq!(host, "127.0.0.1");
            assert_eq!(bus_id, "1-1.1");
        }
        other => panic!("Expected NotAttached, got {:?}", other),
    }
    assert!(local.calls_for("detach").is_empty());
}

#[tokio::test]
async fn test_detach_ignores_port_from_other_server() {
    let (_server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    local.push_output("port", CommandOutput::ok(port_output("192.168.1.30", "1-1.1")));
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let result = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.detach(&DeviceRequest::by_id("2e8a:000a")),
    )
    .await;

    assert!(matches!(result, Err(ClientError::NotAttached { .. })));
    assert!(local.calls_for("detach").is_empty());
}

#[tokio::test]
async fn test_detach_local_failure_keeps_server_binding() {
    let (server, port) = start_server("127.0.0.1", 0).await;
    let local = Arc::new(MockRunner::new());
    local.push_output("port", CommandOutput::ok(port_output("127.0.0.1", "1-1.1")));
    local.push_output("detach", CommandOutput::failed(1, "usbip: error: detach port"));
    let dispatcher = dispatcher(&["127.0.0.1"], port, &local);

    let result = with_timeout(
        DEFAULT_TEST_TIMEOUT,
        dispatcher.detach(&DeviceRequest::by_id("2e8a:000a")),
    )
    .await;

    assert!(matches!(result, Err(ClientError::Tool(_))));
    // Only the initial find reached the server
    assert_eq!(server.runner.calls_for("list").len(), 1);
}
