//! Purpose: End-to-end tests for the HTTP query server.
//! Exports: None (integration test module).
//! Role: Validate routing, status codes, content type and Parquet bodies across TCP.
//! Invariants: Uses a loopback-only server over a temp data directory.
//! Invariants: Bounded waits avoid test flakiness; server processes are killed on drop.

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use arrow::array::{Float64Array, Int64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

struct TestServer {
    child: Child,
    base_url: String,
}

impl TestServer {
    fn start(data_dir: &Path) -> TestResult<Self> {
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let mut child = Command::new(env!("CARGO_BIN_EXE_colserve"))
                .arg("serve")
                .arg("--data-dir")
                .arg(data_dir)
                .arg("--bind")
                .arg(&bind)
                .env("RUST_LOG", "warn")
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url: format!("http://{bind}"),
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let url = format!("http://{addr}/");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(format!("server exited before ready (status: {status}, stderr: {stderr})").into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}

fn write_catalog(data_dir: &Path) -> TestResult<()> {
    let dir = data_dir.join("Norder=3").join("Dir=0");
    std::fs::create_dir_all(&dir)?;
    let schema = Arc::new(Schema::new(vec![
        Field::new("_hipscat_index", DataType::UInt64, false),
        Field::new("ra", DataType::Float64, false),
        Field::new("dec", DataType::Float64, false),
        Field::new("mag", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt64Array::from(vec![1, 2, 3])),
            Arc::new(Float64Array::from(vec![30.5, 10.0, 45.0])),
            Arc::new(Float64Array::from(vec![-31.0, -20.0, -35.5])),
            Arc::new(Int64Array::from(vec![17, 19, 21])),
        ],
    )?;
    let file = std::fs::File::create(dir.join("Npix=754.parquet"))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    std::fs::write(data_dir.join("notes.parquet"), b"definitely not parquet")?;
    Ok(())
}

fn fetch_bytes(url: &str) -> TestResult<(String, Vec<u8>)> {
    let resp = ureq::get(url).call()?;
    let content_type = resp.header("content-type").unwrap_or_default().to_string();
    let mut body = Vec::new();
    resp.into_reader().read_to_end(&mut body)?;
    Ok((content_type, body))
}

fn expect_error(url: &str, status: u16) -> TestResult<Value> {
    match ureq::get(url).call() {
        Err(ureq::Error::Status(code, resp)) => {
            assert_eq!(code, status, "unexpected status for {url}");
            Ok(serde_json::from_str(&resp.into_string()?)?)
        }
        Ok(resp) => Err(format!("expected {status}, got {}", resp.status()).into()),
        Err(err) => Err(err.into()),
    }
}

fn column_names(body: Vec<u8>) -> TestResult<(Vec<String>, usize)> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(body))?;
    let names = builder
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().to_string())
        .collect();
    let mut rows = 0;
    for batch in builder.build()? {
        rows += batch?.num_rows();
    }
    Ok((names, rows))
}

#[test]
fn health_route_reports_online() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(temp.path())?;
    let body = ureq::get(&server.url("/")).call()?.into_string()?;
    assert_eq!(body, "online");
    Ok(())
}

#[test]
fn projection_and_filter_over_http() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    write_catalog(temp.path())?;
    let server = TestServer::start(temp.path())?;

    let (content_type, body) =
        fetch_bytes(&server.url("/Norder=3/Dir=0/Npix=754.parquet"))?;
    assert_eq!(content_type, "application/vnd.apache.parquet");
    let (names, rows) = column_names(body)?;
    assert_eq!(names, vec!["_hipscat_index", "ra", "dec", "mag"]);
    assert_eq!(rows, 3);

    let (_, body) = fetch_bytes(&server.url(
        "/Norder=3/Dir=0/Npix=754.parquet?cols=dec,ra&query=ra%3E%3D30.1,dec%3C%3D-30.3",
    ))?;
    let (names, rows) = column_names(body)?;
    assert_eq!(names, vec!["dec", "ra"]);
    assert_eq!(rows, 2);

    let (_, body) = fetch_bytes(&server.url("/Norder=3/Dir=0/Npix=754.parquet?query=mag%3C20"))?;
    let (names, rows) = column_names(body)?;
    assert_eq!(names, vec!["ra", "dec", "mag"]);
    assert_eq!(rows, 2);
    Ok(())
}

#[test]
fn error_kinds_map_to_status_codes() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    write_catalog(temp.path())?;
    let server = TestServer::start(temp.path())?;
    let catalog = "/Norder=3/Dir=0/Npix=754.parquet";

    let err = expect_error(&server.url(&format!("{catalog}?query=ra%3E%3E10")), 400)?;
    assert_eq!(err["error"]["kind"], "InvalidPredicateSyntax");
    assert_eq!(err["error"]["segment"], "ra>>10");

    let err = expect_error(&server.url(&format!("{catalog}?cols=ra,mag_r")), 400)?;
    assert_eq!(err["error"]["kind"], "UnknownColumn");
    assert_eq!(err["error"]["column"], "mag_r");

    let err = expect_error(&server.url("/Norder=3/missing.parquet"), 404)?;
    assert_eq!(err["error"]["kind"], "NotFound");

    let err = expect_error(&server.url("/notes.parquet"), 500)?;
    assert_eq!(err["error"]["kind"], "SourceUnreadable");

    let err = expect_error(&server.url(&format!("{catalog}?cols=ra&cols=dec")), 400)?;
    assert_eq!(err["error"]["kind"], "Usage");
    Ok(())
}

#[test]
fn traversal_outside_data_dir_is_rejected() -> TestResult<()> {
    let outer = tempfile::tempdir()?;
    let served = outer.path().join("served");
    std::fs::create_dir(&served)?;
    std::fs::write(outer.path().join("secret.parquet"), b"x")?;
    let server = TestServer::start(&served)?;

    let err = expect_error(&server.url("/%2E%2E%2Fsecret.parquet"), 400)?;
    assert_eq!(err["error"]["kind"], "Usage");
    Ok(())
}
