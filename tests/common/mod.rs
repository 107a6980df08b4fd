//! Shared helpers for integration tests.
#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::time::Duration;

use inlet::{BufferItem, InletServer, KeepAliveConfig, ServerHandle};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::sleep};

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Liveness settings fast enough for a test run but slow enough that no
/// timeout fires during unrelated assertions.
pub fn relaxed_keep_alive() -> KeepAliveConfig {
    KeepAliveConfig {
        interval: Duration::from_secs(5),
        check_period: 2,
        timeout: Duration::from_secs(60),
    }
}

/// Start a server on an ephemeral loopback port with relaxed liveness.
pub fn start_server() -> TestResult<ServerHandle> { start_server_with(relaxed_keep_alive()) }

/// Start a server on an ephemeral loopback port with the given liveness.
pub fn start_server_with(keep_alive: KeepAliveConfig) -> TestResult<ServerHandle> {
    Ok(InletServer::new()
        .keep_alive(keep_alive)
        .bind(([127, 0, 0, 1], 0).into())?
        .start())
}

/// Connect a client to the server under test.
pub async fn connect(handle: &ServerHandle) -> TestResult<TcpStream> {
    let addr = handle.local_addr().ok_or("server has no local address")?;
    Ok(TcpStream::connect(addr).await?)
}

/// Write `bytes` to the server and flush.
pub async fn send(stream: &mut TcpStream, bytes: &[u8]) -> TestResult {
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Poll the non-blocking queue until an item arrives or two seconds pass.
pub async fn next_message(handle: &ServerHandle) -> Option<BufferItem> {
    for _ in 0..200 {
        if let Some(item) = handle.read_message() {
            return Some(item);
        }
        sleep(Duration::from_millis(10)).await;
    }
    None
}

/// Give in-flight reads a moment, then confirm nothing was delivered.
pub async fn assert_no_message(handle: &ServerHandle) {
    sleep(Duration::from_millis(100)).await;
    assert!(handle.read_message().is_none(), "unexpected ingress item");
}

/// Poll until `count` peers are connected or two seconds pass.
pub async fn wait_for_peer_count(handle: &ServerHandle, count: usize) -> bool {
    for _ in 0..200 {
        if handle.connected_peers().len() == count {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}
