//! Purpose: Provide the HTTP server that answers Parquet queries for files under a data directory.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum collaborator around `api::execute_query_with`; owns paths, limits, status codes and logs.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: Paths are resolved inside `data_dir`; missing files are 404 before the query core runs.
//! Invariants: Each query runs on a blocking worker and is cancelled if the request is dropped.
//! Notes: Success bodies are raw Parquet; errors are a JSON envelope with a stable `kind`.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use colserve::api::{
    CancelFlag, Error, ErrorKind, QueryOptions, QueryParams, ScanOptions, execute_query_with,
};

use crate::data_paths::{DataPathError, resolve_data_path};

pub const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub allow_non_loopback: bool,
    pub batch_size: usize,
    pub max_concurrent_queries: usize,
}

struct AppState {
    data_dir: PathBuf,
    options: QueryOptions,
    query_semaphore: Arc<Semaphore>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let data_dir = std::fs::canonicalize(&config.data_dir).map_err(|err| {
        Error::new(ErrorKind::NotFound)
            .with_message("failed to resolve data directory")
            .with_path(&config.data_dir)
            .with_source(err)
    })?;

    let state = Arc::new(AppState {
        data_dir,
        options: QueryOptions {
            scan: ScanOptions {
                batch_size: config.batch_size,
            },
            ..QueryOptions::default()
        },
        query_semaphore: Arc::new(Semaphore::new(config.max_concurrent_queries)),
    });

    let app = Router::new()
        .route("/", get(online))
        .route("/*path", get(query_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(
        bind = %config.bind,
        data_dir = %state.data_dir.display(),
        "serving parquet queries"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.batch_size == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--batch-size must be greater than zero")
            .with_hint("Use a positive value like 8192."));
    }

    if config.max_concurrent_queries == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-concurrent-queries must be greater than zero")
            .with_hint("Use a positive value like 32."));
    }

    if !config.data_dir.is_dir() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("data directory does not exist")
            .with_path(&config.data_dir)
            .with_hint("Pass an existing directory with --data-dir."));
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn online() -> &'static str {
    "online"
}

/// Raises the flag when the handler future is dropped (client went away or the query finished).
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn query_file(
    State(state): State<Arc<AppState>>,
    AxumPath(path): AxumPath<String>,
    params: Result<Query<QueryParams>, QueryRejection>,
) -> Response {
    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => return error_response(query_params_error(&rejection)),
    };
    let source = match resolve_data_path(&path, &state.data_dir) {
        Ok(source) => source,
        Err(err) => return error_response(data_path_error(err, &path)),
    };
    let permit = match state.query_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            return error_response(
                Error::new(ErrorKind::Busy)
                    .with_message("too many concurrent queries")
                    .with_hint("Try again later."),
            );
        }
    };

    let cancel = CancelFlag::new();
    let _cancel_on_drop = CancelOnDrop(cancel.clone());
    let options = state.options;
    let started = Instant::now();
    let task = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        execute_query_with(&source, &params, options, &cancel)
    });

    let result = match task.await {
        Ok(result) => result,
        Err(err) => Err(Error::new(ErrorKind::Internal)
            .with_message("query worker failed")
            .with_source(err)),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(bytes) => {
            tracing::info!(path = %path, bytes = bytes.len(), elapsed_ms, "query served");
            parquet_response(bytes)
        }
        Err(err) => {
            if err.kind().is_client_error() {
                tracing::info!(path = %path, error = %err, elapsed_ms, "query rejected");
            } else {
                tracing::error!(path = %path, error = %err, elapsed_ms, "query failed");
            }
            error_response(err)
        }
    }
}

fn query_params_error(rejection: &QueryRejection) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(rejection.body_text())
        .with_hint("Pass each of cols, query and exclude_cols at most once.")
}

fn data_path_error(err: DataPathError, path: &str) -> Error {
    match err {
        DataPathError::Empty => Error::new(ErrorKind::Usage)
            .with_message("missing file path")
            .with_hint("Request a file such as /catalog/Npix=0.parquet."),
        DataPathError::Traversal => Error::new(ErrorKind::Usage)
            .with_message(format!("path escapes the data directory: {path}")),
        DataPathError::NotFound => {
            Error::new(ErrorKind::NotFound).with_message(format!("file not found: {path}"))
        }
        DataPathError::NotAFile => {
            Error::new(ErrorKind::NotFound).with_message(format!("not a file: {path}"))
        }
    }
}

fn parquet_response(bytes: Vec<u8>) -> Response {
    let mut response = Bytes::from(bytes).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PARQUET_CONTENT_TYPE),
    );
    response
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    segment: Option<String>,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage | ErrorKind::InvalidPredicateSyntax | ErrorKind::UnknownColumn => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Busy | ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::SourceUnreadable | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            column: err.column().map(str::to_string),
            segment: err.segment().map(str::to_string),
        },
    };
    (status, Json(body)).into_response()
}
