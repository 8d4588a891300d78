//! End-to-End Tests
//!
//! Real TCP server on an ephemeral port, exercised both with raw request
//! lines (to pin down exact framing) and through `DataClient`:
//! 1. getdata against a fake source decodes to exactly the served rows
//! 2. Row guard rejections arrive as one error line
//! 3. Text framing for menu and source text actions
//! 4. Bad requests leave the connection usable
//! 5. Connection limit refuses, not queues
//! 6. Client retry reconnects across a server restart
//! 7. Shutdown mid-fetch closes the connection with no partial response

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tsdx::config::SourceConfig;
use tsdx::matrix::codec::Layout;
use tsdx::protocol::response::decode_binary;
use tsdx::protocol::{RequestParams, Response};
use tsdx::source::{DataSource, SourceData, SourceError, Window};
use tsdx::{ClientConfig, DataClient, DataMatrix, DataServer, ServerConfig, SourceRegistry};

/// Serves 50 rows `[t, 2t]` for t = 0..50, ignoring the window.
struct FakeSource;

fn fifty_rows() -> DataMatrix {
    DataMatrix::from_rows((0..50).map(|t| vec![t as f64, t as f64 * 2.0]).collect()).unwrap()
}

impl DataSource for FakeSource {
    fn kind(&self) -> &str {
        "X"
    }

    fn description(&self) -> &str {
        "fake fifty rows"
    }

    fn get_data(&self, params: &RequestParams, window: &Window) -> Result<SourceData, SourceError> {
        match params.get("action").unwrap_or("data") {
            "data" => {
                let all = fifty_rows();
                let rows = (0..all.rows())
                    .filter(|&i| window.contains(all.time(i)))
                    .map(|i| all.row(i).to_vec())
                    .collect::<Vec<_>>();
                let mut out = DataMatrix::new(2);
                for row in rows {
                    out.push_row(&row).unwrap();
                }
                Ok(SourceData::Matrix(out))
            }
            "notes" => Ok(SourceData::Lines(vec!["first".into(), "second".into()])),
            other => Err(SourceError::UnsupportedAction(other.to_string())),
        }
    }
}

fn registry() -> SourceRegistry {
    let registry = SourceRegistry::new();
    registry.register_instance("X", Arc::new(FakeSource)).unwrap();
    registry
}

struct Running {
    addr: String,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap();
    }
}

async fn start_at(listen: &str, config: ServerConfig, registry: SourceRegistry) -> Running {
    let server = DataServer::bind(&config.with_listen_addr(listen), Arc::new(registry))
        .await
        .unwrap();
    let addr = server.local_addr().to_string();
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(server.run());
    Running {
        addr,
        shutdown,
        handle,
    }
}

async fn start(config: ServerConfig) -> Running {
    start_at("127.0.0.1:0", config, registry()).await
}

struct RawConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawConn {
    async fn open(addr: &str) -> Self {
        let (read_half, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        RawConn {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line
    }

    async fn body(&mut self, len: usize) -> Vec<u8> {
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await.unwrap();
        body
    }
}

// ============================================================================
// Test 1: getdata end to end
// ============================================================================

#[tokio::test]
async fn test_getdata_binary_round_trip() {
    let server = start(ServerConfig::default()).await;
    let mut conn = RawConn::open(&server.addr).await;

    conn.send("getdata: source=X;action=data;ch=1;rk=1;st=0;et=100;ds=N;dsInt=0\n")
        .await;
    let header = conn.line().await;
    let bytes: usize = header
        .trim_end()
        .strip_prefix("ok: type=X;bytes=")
        .unwrap_or_else(|| panic!("unexpected header {:?}", header))
        .parse()
        .unwrap();

    let body = conn.body(bytes).await;
    let blocks = decode_binary(&body, Layout::Explicit).unwrap();
    assert_eq!(blocks, vec![fifty_rows()]);

    server.stop().await;
}

#[tokio::test]
async fn test_client_get_matrix_and_downsampling() {
    let server = start(ServerConfig::default()).await;
    let mut client = DataClient::new(&ClientConfig::new(&server.addr));

    let params = RequestParams::new().with("source", "X").with("st", "0").with("et", "100");
    assert_eq!(client.get_matrix(&params).await.unwrap(), fifty_rows());

    let decimated = client
        .get_matrix(&params.clone().with("ds", "D").with("dsInt", "7"))
        .await
        .unwrap();
    assert_eq!(decimated.rows(), 8);
    assert_eq!(decimated.row(3), &[21.0, 42.0]);

    let means = client
        .get_matrix(&params.clone().with("ds", "M").with("dsInt", "10"))
        .await
        .unwrap();
    assert_eq!(means.rows(), 5);
    assert_eq!(means.row(0), &[0.0, 9.0]);

    server.stop().await;
}

#[tokio::test]
async fn test_chunked_fetch_matches_single_fetch() {
    let server = start(ServerConfig::default()).await;
    let mut client = DataClient::new(&ClientConfig::new(&server.addr));

    let params = RequestParams::new().with("source", "X").with("st", "0").with("et", "49");
    let stitched = client.get_data_chunked(&params, 10.0).await.unwrap().unwrap();
    assert_eq!(stitched, fifty_rows());

    let empty = RequestParams::new().with("source", "X").with("st", "100").with("et", "200");
    assert_eq!(client.get_data_chunked(&empty, 30.0).await.unwrap(), None);

    server.stop().await;
}

// ============================================================================
// Test 2: row guard
// ============================================================================

#[tokio::test]
async fn test_row_guard_over_the_wire() {
    let server = start(ServerConfig::default().with_max_rows(49)).await;
    let mut conn = RawConn::open(&server.addr).await;

    conn.send("getdata: source=X;st=0;et=100;ds=N;dsInt=0\n").await;
    assert_eq!(
        conn.line().await,
        "error: max rows (49) exceeded for source 'X' (50 rows); use downsampling\n"
    );

    // Same connection, now downsampled below the limit.
    conn.send("getdata: source=X;st=0;et=100;ds=D;dsInt=2\n").await;
    assert!(conn.line().await.starts_with("ok: type=X;bytes="));

    server.stop().await;
}

// ============================================================================
// Test 3: text framing
// ============================================================================

#[tokio::test]
async fn test_version_and_counted_text() {
    let server = start(ServerConfig::default()).await;
    let mut conn = RawConn::open(&server.addr).await;

    conn.send("version:\n").await;
    assert_eq!(conn.line().await, "version=1.0.0\n");

    conn.send("menu:\n").await;
    assert_eq!(conn.line().await, "ok: lines=1\n");
    assert_eq!(
        conn.line().await,
        "source=X; description=fake fifty rows; type=X;\n"
    );

    conn.send("getdata: source=X;action=notes\n").await;
    assert_eq!(conn.line().await, "ok: lines=2\n");
    assert_eq!(conn.line().await, "first\n");
    assert_eq!(conn.line().await, "second\n");

    server.stop().await;
}

#[tokio::test]
async fn test_configured_synthetic_source() {
    let mut options = toml::Table::new();
    options.insert("interval".into(), toml::Value::Integer(10));
    let config = ServerConfig::default().with_source(SourceConfig {
        name: "wave".into(),
        kind: "synthetic".into(),
        description: "Test wave".into(),
        options,
    });
    let server = DataServer::from_config(&config.with_listen_addr("127.0.0.1:0"))
        .await
        .unwrap();
    let addr = server.local_addr().to_string();
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(server.run());

    let mut client = DataClient::new(&ClientConfig::new(&addr));
    let menu = client.menu().await.unwrap();
    assert_eq!(menu.len(), 1);
    assert_eq!(menu[0].kind, "synthetic");

    let params = RequestParams::new()
        .with("source", "wave")
        .with("ch", "1,2")
        .with("st", "0")
        .with("et", "600")
        .with("ds", "M")
        .with("dsInt", "300");
    match client.get_data(&params).await.unwrap() {
        Response::Binary { header, blocks } => {
            assert_eq!(header.kind(), Some("synthetic"));
            assert_eq!(blocks[0].rows(), 3);
            assert_eq!(blocks[0].columns(), 3);
        }
        other => panic!("expected binary response, got {:?}", other),
    }

    shutdown.cancel();
    handle.await.unwrap();
}

// ============================================================================
// Test 4: bad requests
// ============================================================================

#[tokio::test]
async fn test_bad_requests_keep_connection_open() {
    let server = start(ServerConfig::default()).await;
    let mut conn = RawConn::open(&server.addr).await;

    conn.send("no delimiter here\n").await;
    assert_eq!(conn.line().await, "error: malformed request: no delimiter here\n");

    conn.send("frobnicate: a=b\n").await;
    assert_eq!(conn.line().await, "error: unknown command: frobnicate\n");

    conn.send("getdata: source=missing\n").await;
    assert_eq!(conn.line().await, "error: unknown source: missing\n");

    conn.send(&format!("getdata: source={}\n", "x".repeat(10_000))).await;
    assert!(conn.line().await.starts_with("error: request line too long"));

    conn.send("version:\n").await;
    assert_eq!(conn.line().await, "version=1.0.0\n");

    server.stop().await;
}

// ============================================================================
// Test 5: connection limit
// ============================================================================

#[tokio::test]
async fn test_connections_beyond_limit_are_refused() {
    let server = start(ServerConfig::default().with_max_connections(1)).await;

    let mut first = RawConn::open(&server.addr).await;
    first.send("version:\n").await;
    assert_eq!(first.line().await, "version=1.0.0\n");

    let mut second = RawConn::open(&server.addr).await;
    assert_eq!(second.line().await, "error: too many connections\n");

    // The held connection still works.
    first.send("version:\n").await;
    assert_eq!(first.line().await, "version=1.0.0\n");

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients() {
    let server = start(ServerConfig::default().with_handlers(2)).await;

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let addr = server.addr.clone();
            tokio::spawn(async move {
                let mut client = DataClient::new(&ClientConfig::new(&addr));
                let params = RequestParams::new()
                    .with("source", "X")
                    .with("st", i.to_string())
                    .with("et", "49");
                client.get_matrix(&params).await.unwrap().rows()
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), 50 - i);
    }

    server.stop().await;
}

// ============================================================================
// Test 6: retry across restart
// ============================================================================

#[tokio::test]
async fn test_client_reconnects_after_restart() {
    let server = start(ServerConfig::default()).await;
    let addr = server.addr.clone();

    let config = ClientConfig::new(&addr).with_max_attempts(3).with_read_timeout_secs(2);
    let mut client = DataClient::connect(&config).await.unwrap();
    assert_eq!(client.version().await.unwrap(), "1.0.0");

    server.stop().await;
    let restarted = start_at(&addr, ServerConfig::default(), registry()).await;

    // The old socket is dead; the retry wrapper reopens it.
    assert_eq!(client.version().await.unwrap(), "1.0.0");
    let params = RequestParams::new().with("source", "X").with("st", "0").with("et", "9");
    assert_eq!(client.get_matrix(&params).await.unwrap().rows(), 10);

    restarted.stop().await;
}

#[tokio::test]
async fn test_client_gives_up_when_server_is_gone() {
    let server = start(ServerConfig::default()).await;
    let addr = server.addr.clone();
    server.stop().await;

    let config = ClientConfig::new(&addr).with_max_attempts(2).with_read_timeout_secs(1);
    let mut client = DataClient::new(&config);
    let err = client.menu().await.unwrap_err();
    assert!(err.to_string().contains("after 2 attempts"), "{}", err);
}

// ============================================================================
// Test 7: shutdown during a fetch
// ============================================================================

/// Signals when a fetch starts, then blocks until released.
struct BlockingSource {
    entered: Arc<tokio::sync::Notify>,
    release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
}

impl DataSource for BlockingSource {
    fn kind(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "blocks until released"
    }

    fn get_data(&self, _params: &RequestParams, _window: &Window) -> Result<SourceData, SourceError> {
        self.entered.notify_one();
        let _ = self.release.lock().unwrap().recv();
        Ok(SourceData::Matrix(fifty_rows()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_mid_fetch_closes_without_partial_response() {
    let entered = Arc::new(tokio::sync::Notify::new());
    let (release, blocked) = std::sync::mpsc::channel();
    let registry = SourceRegistry::new();
    registry
        .register_instance(
            "slow",
            Arc::new(BlockingSource {
                entered: Arc::clone(&entered),
                release: std::sync::Mutex::new(blocked),
            }),
        )
        .unwrap();
    let server = start_at("127.0.0.1:0", ServerConfig::default(), registry).await;

    let mut conn = RawConn::open(&server.addr).await;
    conn.send("getdata: source=slow;st=0;et=100\n").await;
    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .unwrap();

    server.shutdown.cancel();
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), conn.reader.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty(), "got {} bytes after shutdown", rest.len());

    release.send(()).unwrap();
    server.handle.await.unwrap();
}
