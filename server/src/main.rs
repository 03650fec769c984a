//! HTTP front end for a PesaDB data root.
//!
//! Translates JSON requests into [`Engine`] calls and engine failures into
//! HTTP status codes. One engine instance sits behind a mutex, so requests
//! are applied one at a time.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use pesadb_engine::{
    ColumnSchema, ColumnType, Engine, EngineConfig, EngineError, Predicate, Row, TableSchema,
    Value,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// PesaDB HTTP server
#[derive(Parser, Debug)]
#[command(name = "pesadb-server", version, about = "Serve a PesaDB data root over HTTP")]
struct Args {
    /// Address to bind
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "PESADB_HOST")]
    host: String,

    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 8080, env = "PESADB_PORT")]
    port: u16,

    /// Root directory holding one subdirectory per database
    #[arg(short = 'd', long, value_name = "DIR", default_value = "data", env = "PESADB_DATA_DIR")]
    data_dir: PathBuf,

    /// Database to select at startup
    #[arg(long, env = "PESADB_DATABASE")]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PESADB_LOG_LEVEL")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<Engine>>,
}

impl AppState {
    fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ColumnRequest {
    name: String,
    #[serde(rename = "type")]
    column_type: ColumnType,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug)]
enum ApiError {
    Engine(EngineError),
    BadRequest { code: &'static str, message: String },
    RouteNotFound,
    LockPoisoned,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            code,
            message: message.into(),
        }
    }

    fn into_response(self) -> Response<Body> {
        match self {
            ApiError::Engine(err) => engine_error_to_response(err),
            ApiError::BadRequest { code, message } => {
                json_error(StatusCode::BAD_REQUEST, code, &message)
            }
            ApiError::RouteNotFound => {
                json_error(StatusCode::NOT_FOUND, "route_not_found", "route not found")
            }
            ApiError::LockPoisoned => json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "engine_lock",
                "engine lock poisoned",
            ),
        }
    }
}

type ApiResult = Result<Response<Body>, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut engine = Engine::open(EngineConfig::new().with_data_dir(&args.data_dir));
    if let Some(database) = &args.database {
        engine
            .select_database(database)
            .with_context(|| format!("failed to select database '{database}'"))?;
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid listen address")?;
    let state = AppState::new(engine);
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(req, state).await }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown_signal());
    info!(%addr, data_dir = %args.data_dir.display(), "listening");
    server.await.context("server error")?;
    info!("server stopped");
    Ok(())
}

fn init_logging(args: &Args) {
    let level = if args.verbose { "debug" } else { &args.log_level };
    let filter = EnvFilter::try_new(format!("pesadb_server={level},pesadb_engine={level}"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        return;
    }
    info!("shutdown requested");
}

async fn handle_request(
    req: Request<Body>,
    state: AppState,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let segments: Vec<String> = req
        .uri()
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(url_decode)
        .collect();
    let query = req.uri().query().map(parse_query).unwrap_or_default();
    debug!(%method, path = req.uri().path(), "request");

    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    let result = route(&method, &segments, &query, req.into_body(), &state).await;
    Ok(result.unwrap_or_else(ApiError::into_response))
}

async fn route(
    method: &Method,
    segments: &[&str],
    query: &[(String, String)],
    body: Body,
    state: &AppState,
) -> ApiResult {
    match (method, segments) {
        (&Method::GET, ["health"]) => Ok(Response::new(Body::from("ok"))),
        (&Method::GET, []) => {
            let engine = lock(state)?;
            let tables = match engine.active_database() {
                Some(_) => engine.table_names()?,
                None => Vec::new(),
            };
            Ok(json_ok(
                StatusCode::OK,
                &json!({
                    "status": "ok",
                    "database": engine.active_database(),
                    "tables": tables,
                }),
            ))
        }
        (&Method::GET, ["databases"]) => {
            let databases = lock(state)?.list_databases()?;
            Ok(json_ok(StatusCode::OK, &databases))
        }
        (&Method::PUT, ["databases", name]) => {
            let mut engine = lock(state)?;
            engine.select_database(name)?;
            Ok(json_ok(
                StatusCode::OK,
                &json!({ "database": name, "tables": engine.table_names()? }),
            ))
        }
        (&Method::DELETE, ["databases", name]) => {
            lock(state)?.drop_database(name)?;
            Ok(json_ok(StatusCode::OK, &json!({ "dropped": name })))
        }
        (&Method::POST, ["tables"]) => {
            let schema: TableSchema = read_json(body).await?;
            let mut engine = lock(state)?;
            let name = schema.name.clone();
            engine.create_table(schema)?;
            Ok(json_ok(StatusCode::CREATED, engine.schema(&name)?))
        }
        (&Method::GET, ["tables", name]) => {
            let engine = lock(state)?;
            Ok(json_ok(StatusCode::OK, engine.schema(name)?))
        }
        (&Method::DELETE, ["tables", name]) => {
            lock(state)?.drop_table(name)?;
            Ok(json_ok(StatusCode::OK, &json!({ "dropped": name })))
        }
        (&Method::GET, ["tables", name, "rows"]) => {
            let predicate = match query {
                [] => None,
                [(column, value)] => Some(Predicate::equals(column.as_str(), value.as_str())),
                _ => {
                    return Err(EngineError::InvalidPredicate(
                        "select takes a single column=value filter".to_string(),
                    )
                    .into())
                }
            };
            let rows = lock(state)?.select(name, predicate.as_ref())?;
            Ok(json_ok(StatusCode::OK, &rows))
        }
        (&Method::POST, ["tables", name, "rows"]) => {
            let row: Row = read_json(body).await?;
            let stored = lock(state)?.insert(name, row)?;
            Ok(json_ok(StatusCode::CREATED, &stored))
        }
        (&Method::PATCH, ["tables", name, "rows", key]) => {
            let fields: Row = read_json(body).await?;
            let updated = lock(state)?.update(name, &Value::text(*key), fields)?;
            Ok(json_ok(StatusCode::OK, &updated))
        }
        (&Method::DELETE, ["tables", name, "rows"]) => {
            let predicate: Row = read_json_or_default(body).await?;
            let deleted = lock(state)?.delete(name, &predicate)?;
            Ok(json_ok(StatusCode::OK, &json!({ "deleted": deleted })))
        }
        (&Method::POST, ["tables", name, "columns"]) => {
            let request: ColumnRequest = read_json(body).await?;
            let mut engine = lock(state)?;
            engine.add_column(
                name,
                ColumnSchema::new(request.name, request.column_type),
                request.default,
            )?;
            Ok(json_ok(StatusCode::CREATED, engine.schema(name)?))
        }
        (&Method::DELETE, ["tables", name, "columns", column]) => {
            let mut engine = lock(state)?;
            engine.remove_column(name, column)?;
            Ok(json_ok(StatusCode::OK, engine.schema(name)?))
        }
        (&Method::GET, ["join"]) => {
            let param = |key: &str| {
                query
                    .iter()
                    .find(|(name, _)| name == key)
                    .map(|(_, value)| value.as_str())
                    .ok_or_else(|| {
                        ApiError::bad_request(
                            "invalid_request",
                            format!("missing query parameter '{key}'"),
                        )
                    })
            };
            let (left, right) = (param("left")?, param("right")?);
            let (left_column, right_column) = (param("left_column")?, param("right_column")?);
            let rows = lock(state)?.join(left, right, left_column, right_column)?;
            Ok(json_ok(StatusCode::OK, &rows))
        }
        _ => Err(ApiError::RouteNotFound),
    }
}

fn lock(state: &AppState) -> Result<std::sync::MutexGuard<'_, Engine>, ApiError> {
    state.engine.lock().map_err(|_| ApiError::LockPoisoned)
}

async fn read_body(body: Body) -> Result<hyper::body::Bytes, ApiError> {
    hyper::body::to_bytes(body)
        .await
        .map_err(|err| ApiError::bad_request("invalid_body", err.to_string()))
}

async fn read_json<T: DeserializeOwned>(body: Body) -> Result<T, ApiError> {
    let bytes = read_body(body).await?;
    decode_json(&bytes)
}

/// Like [`read_json`], but an empty body yields `T::default()`.
async fn read_json_or_default<T: DeserializeOwned + Default>(body: Body) -> Result<T, ApiError> {
    let bytes = read_body(body).await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    decode_json(&bytes)
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ApiError::bad_request("invalid_json", err.to_string()))
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(key), url_decode(value))
        })
        .collect()
}

/// Decodes `%XX` escapes and `+`. Malformed escapes are kept verbatim;
/// invalid UTF-8 is replaced.
fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let escaped = input
                    .get(i + 1..i + 3)
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match escaped {
                    Some(byte) => {
                        decoded.push(byte);
                        i += 3;
                        continue;
                    }
                    None => decoded.push(b'%'),
                }
            }
            b'+' => decoded.push(b' '),
            byte => decoded.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn with_json_header(mut response: Response<Body>, status: StatusCode) -> Response<Body> {
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn json_ok<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => with_json_header(Response::new(Body::from(body)), status),
        Err(err) => {
            error!(error = %err, "failed to encode response");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "encode_error", "encode error")
        }
    }
}

fn json_error(status: StatusCode, code: &str, message: &str) -> Response<Body> {
    let body = serde_json::to_vec(&ErrorResponse {
        error: ErrorBody {
            code: code.to_string(),
            message: message.to_string(),
        },
    })
    .unwrap_or_else(|_| b"{\"error\":{\"code\":\"internal\",\"message\":\"internal\"}}".to_vec());
    with_json_header(Response::new(Body::from(body)), status)
}

fn engine_error_to_response(err: EngineError) -> Response<Body> {
    let (status, code) = match &err {
        EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        EngineError::NoActiveDatabase => (StatusCode::BAD_REQUEST, "no_active_database"),
        EngineError::MissingColumn { .. } => (StatusCode::BAD_REQUEST, "missing_column"),
        EngineError::TypeCoercion { .. } => (StatusCode::BAD_REQUEST, "type_coercion"),
        EngineError::UnknownColumn { .. } => (StatusCode::BAD_REQUEST, "unknown_column"),
        EngineError::InvalidSchema(_) => (StatusCode::BAD_REQUEST, "invalid_schema"),
        EngineError::InvalidName(_) => (StatusCode::BAD_REQUEST, "invalid_name"),
        EngineError::InvalidPredicate(_) => (StatusCode::BAD_REQUEST, "invalid_predicate"),
        EngineError::DuplicateKey { .. } => (StatusCode::CONFLICT, "duplicate_key"),
        EngineError::ForeignKeyViolation { .. } => (StatusCode::CONFLICT, "foreign_key_violation"),
        EngineError::IntegrityViolation(_) => (StatusCode::CONFLICT, "integrity_violation"),
        EngineError::TableExists(_) => (StatusCode::CONFLICT, "table_exists"),
        EngineError::Io(_) | EngineError::Corrupt { .. } => {
            error!(error = %err, "storage failure");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
        }
    };
    json_error(status, code, &err.to_string())
}
