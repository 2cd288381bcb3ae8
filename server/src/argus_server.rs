// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// The operator-facing surface: REST for program configuration, a WebSocket
// for run-time control and the event stream, and static serving of the UI
// bundle. This file also owns process bring-up (flag parsing, logging,
// component wiring) in server_main()/async_main().

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::extract::ws::{Message, WebSocket};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use canonical_error::{CanonicalError, CanonicalErrorCode,
                      invalid_argument_error};
use futures::{SinkExt, StreamExt};
use image::RgbImage;
use log::{error, info, warn};
use pico_args::Arguments;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt, registry};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use argus_elements::clock_trait::SystemClock;
use argus_elements::io_trait::OutputLine;
use argus_elements::types::{Program, ServerEvent};

use crate::diagnostics::Diagnostics;
use crate::image_camera::ImageCamera;
use crate::inspect_engine::{SharedCamera, SharedIo};
use crate::program_store::ProgramStore;
use crate::result_sink::ResultSink;
use crate::sim_io::SimIoHandle;
use crate::trigger_controller::TriggerController;

// Wire representation of a canonical error code.
fn code_label(code: &CanonicalErrorCode) -> &'static str {
    match *code {
        CanonicalErrorCode::InvalidArgument => "INVALID_ARGUMENT",
        CanonicalErrorCode::OutOfRange => "OUT_OF_RANGE",
        CanonicalErrorCode::NotFound => "NOT_FOUND",
        CanonicalErrorCode::AlreadyExists => "ALREADY_EXISTS",
        CanonicalErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
        CanonicalErrorCode::Aborted => "ABORTED",
        CanonicalErrorCode::PermissionDenied => "PERMISSION_DENIED",
        CanonicalErrorCode::Unauthenticated => "UNAUTHENTICATED",
        CanonicalErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
        CanonicalErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
        CanonicalErrorCode::Unavailable => "UNAVAILABLE",
        CanonicalErrorCode::Unimplemented => "UNIMPLEMENTED",
        CanonicalErrorCode::DataLoss => "DATA_LOSS",
        CanonicalErrorCode::Internal => "INTERNAL",
        _ => "UNKNOWN",
    }
}

// The HTTP analog of mapping CanonicalError onto a transport status space.
fn http_status(code: &CanonicalErrorCode) -> StatusCode {
    match *code {
        CanonicalErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        CanonicalErrorCode::OutOfRange => StatusCode::BAD_REQUEST,
        CanonicalErrorCode::NotFound => StatusCode::NOT_FOUND,
        CanonicalErrorCode::AlreadyExists => StatusCode::CONFLICT,
        CanonicalErrorCode::FailedPrecondition => StatusCode::CONFLICT,
        CanonicalErrorCode::Aborted => StatusCode::CONFLICT,
        CanonicalErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        CanonicalErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        CanonicalErrorCode::ResourceExhausted =>
            StatusCode::TOO_MANY_REQUESTS,
        CanonicalErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        CanonicalErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        CanonicalErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct ApiError(CanonicalError);

impl From<CanonicalError> for ApiError {
    fn from(error: CanonicalError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(&self.0.code);
        let body = Json(json!({
            "code": code_label(&self.0.code),
            "message": self.0.message,
        }));
        (status, body).into_response()
    }
}

pub struct ServerState {
    pub store: Arc<ProgramStore>,
    pub controller: TriggerController,
    pub camera: SharedCamera,
    pub io: SharedIo,
    pub sink: Arc<ResultSink>,
    pub diagnostics: Arc<Diagnostics>,
    pub events: broadcast::Sender<ServerEvent>,
}

async fn list_programs(State(state): State<Arc<ServerState>>)
                       -> Result<impl IntoResponse, ApiError> {
    let programs = state.store.list()?;
    Ok(Json(json!({ "programs": programs })))
}

fn validation_response(program: &Program) -> Option<Response> {
    let errors = program.validate();
    if errors.is_empty() {
        return None;
    }
    Some((StatusCode::BAD_REQUEST,
          Json(json!({ "code": "VALIDATION", "errors": errors })))
         .into_response())
}

async fn create_program(State(state): State<Arc<ServerState>>,
                        Json(program): Json<Program>)
                        -> Result<Response, ApiError> {
    if let Some(response) = validation_response(&program) {
        return Ok(response);
    }
    let created = state.store.create(program)?;
    Ok(Json(created).into_response())
}

async fn get_program(State(state): State<Arc<ServerState>>,
                     Path(program_id): Path<i64>)
                     -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get(program_id)?))
}

async fn update_program(State(state): State<Arc<ServerState>>,
                        Path(program_id): Path<i64>,
                        Json(program): Json<Program>)
                        -> Result<Response, ApiError> {
    if let Some(response) = validation_response(&program) {
        return Ok(response);
    }
    let updated = state.store.update(program_id, program)?;
    Ok(Json(updated).into_response())
}

async fn delete_program(State(state): State<Arc<ServerState>>,
                        Path(program_id): Path<i64>)
                        -> Result<impl IntoResponse, ApiError> {
    state.store.delete(program_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_master(State(state): State<Arc<ServerState>>,
                       Path(program_id): Path<i64>,
                       body: axum::body::Bytes)
                       -> Result<impl IntoResponse, ApiError> {
    let (reference, metrics) = state.store.write_master(program_id, &body)?;
    Ok(Json(json!({
        "master_image_ref": reference,
        "quality_metrics": metrics,
    })))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn recent_results(State(state): State<Arc<ServerState>>,
                        Path(program_id): Path<i64>,
                        Query(query): Query<LimitQuery>)
                        -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(20).min(500);
    let results = state.sink.recent(program_id, limit)?;
    Ok(Json(json!({ "results": results })))
}

async fn reset_statistics(State(state): State<Arc<ServerState>>,
                          Path(program_id): Path<i64>)
                          -> Result<impl IntoResponse, ApiError> {
    state.store.reset_statistics(program_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct IoWriteRequest {
    line: OutputLine,
    value: bool,
}

// Maintenance writes to operator-bound lines; only while no run holds the
// outputs.
async fn io_write(State(state): State<Arc<ServerState>>,
                  Json(request): Json<IoWriteRequest>)
                  -> Result<impl IntoResponse, ApiError> {
    if !request.line.operator_bound() {
        return Err(invalid_argument_error(&format!(
            "OUT{} carries fixed wiring and cannot be written",
            request.line.index())).into());
    }
    if state.controller.is_active().await {
        return Err(canonical_error::failed_precondition_error(
            "outputs are owned by the active run").into());
    }
    state.io.lock().unwrap().write(request.line, request.value)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let (run_state, _) = state.controller.run_state().await;
    Json(state.diagnostics.health(run_state))
}

async fn diagnostics_report(State(state): State<Arc<ServerState>>)
                            -> impl IntoResponse {
    Json(state.diagnostics.snapshot())
}

#[derive(Deserialize)]
struct PreviewQuery {
    program_id: i64,
}

// Single frame for the configuration wizard. Mutually exclusive with an
// active run; the engine owns the camera while inspecting.
async fn preview(State(state): State<Arc<ServerState>>,
                 Query(query): Query<PreviewQuery>)
                 -> Result<Response, ApiError> {
    if state.controller.is_active().await {
        return Err(canonical_error::failed_precondition_error(
            "preview is unavailable while a program is running").into());
    }
    let program = state.store.get(query.program_id)?;
    let frame = {
        let mut camera = state.camera.lock().await;
        camera.capture(&program.capture_settings).await?
    };
    let png = argus_elements::image_utils::encode_lossless(&frame.image)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

#[derive(Deserialize)]
struct WsOp {
    op: String,
    program_id: Option<i64>,
}

async fn dispatch_op(state: &ServerState, op: &WsOp)
                     -> Result<(), CanonicalError> {
    match op.op.as_str() {
        "start" => {
            let program_id = op.program_id.ok_or_else(
                || invalid_argument_error("start requires program_id"))?;
            state.controller.start(program_id).await
        }
        "stop" => state.controller.stop().await,
        "pause" => state.controller.pause().await,
        "resume" => state.controller.resume().await,
        "trigger_manual" => state.controller.trigger_manual().await,
        "reset" => state.controller.reset().await,
        other => Err(invalid_argument_error(&format!(
            "unknown op {:?}", other))),
    }
}

async fn ws_handler(State(state): State<Arc<ServerState>>,
                    ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// One task owns the socket sender and interleaves broadcast events with
// per-client error replies; the handler task consumes client ops.
async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => event,
                    // A lagging client just misses events; it never
                    // back-pressures the engine.
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("WebSocket client lagged, {} events lost",
                              missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(event) => event,
                    None => break,
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => break,
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let op: WsOp = match serde_json::from_str(&text) {
            Ok(op) => op,
            Err(e) => {
                let _ = reply_tx.send(ServerEvent::Error {
                    code: "INVALID_FRAME".to_string(),
                    message: format!("unparseable op: {}", e),
                });
                continue;
            }
        };
        if let Err(e) = dispatch_op(&state, &op).await {
            let _ = reply_tx.send(ServerEvent::Error {
                code: code_label(&e.code).to_string(),
                message: e.message,
            });
        }
    }
    drop(reply_tx);
    send_task.abort();
}

pub fn build_router(state: Arc<ServerState>, ui_dir: &str) -> Router {
    Router::new()
        .route("/api/programs", get(list_programs).post(create_program))
        .route("/api/programs/:id",
               get(get_program).put(update_program).delete(delete_program))
        .route("/api/programs/:id/master-image", post(upload_master))
        .route("/api/programs/:id/results", get(recent_results))
        .route("/api/programs/:id/statistics/reset", post(reset_statistics))
        .route("/api/io/write", post(io_write))
        .route("/api/health", get(health))
        .route("/api/diagnostics", get(diagnostics_report))
        .route("/api/preview", get(preview))
        .route("/api/ws", get(ws_handler))
        .nest_service("/", ServeDir::new(ui_dir))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

struct AppArgs {
    data_dir: String,
    ui_dir: String,
    port: u16,
    test_image: Option<String>,
    log_dir: String,
    log_file: String,
}

pub fn server_main(product_name: &str, copyright: &str) {
    const HELP: &str = "\
    FLAGS:
      -h, --help                     Prints help information

    OPTIONS:
      --data_dir <path>              ./argus_data
      --ui_dir <path>                ./argus_ui/build/web
      --port NUMBER                  8080
      --test_image <path>            Serve this image as the camera
      --log_dir <path>               .
      --log_file <file>              argus_log.txt
    ";

    let mut pargs = Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        println!("{}", HELP);
        std::process::exit(0);
    }
    let args = AppArgs {
        data_dir: pargs.value_from_str("--data_dir").
            unwrap_or("./argus_data".to_string()),
        ui_dir: pargs.value_from_str("--ui_dir").
            unwrap_or("./argus_ui/build/web".to_string()),
        port: pargs.value_from_str("--port").
            unwrap_or(8080),
        test_image: pargs.opt_value_from_str("--test_image").unwrap(),
        log_dir: pargs.value_from_str("--log_dir").
            unwrap_or(".".to_string()),
        log_file: pargs.value_from_str("--log_file").
            unwrap_or("argus_log.txt".to_string()),
    };

    // Set up logging.
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir).unwrap();

    // Create non-blocking writers for both the file and stdout.
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    let _subscriber = registry()
        .with(EnvFilter::try_from_default_env()
              .unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    ctrlc::set_handler(move || {
        info!("Got control-c");
        got_signal2.store(true, AtomicOrdering::Relaxed);
        std::thread::sleep(Duration::from_secs(1));
        info!("Exiting");
        std::process::exit(-1);
    }).unwrap();

    async_main(args, product_name, copyright);
}

fn get_camera(test_image: &Option<String>)
              -> Box<dyn argus_elements::camera_trait::CameraTrait + Send> {
    if let Some(path) = test_image {
        match image::open(path) {
            Ok(image) => {
                let image = image.to_rgb8();
                info!("Serving test image {} ({}x{})",
                      path, image.width(), image.height());
                return Box::new(ImageCamera::new(image));
            }
            Err(e) => {
                error!("Could not open test image {}: {}", path, e);
            }
        }
    }
    // Fake up a uniform grey camera.
    let width = 640;
    let height = 480;
    Box::new(ImageCamera::new(
        RgbImage::from_pixel(width, height, image::Rgb([16, 16, 16]))))
}

#[tokio::main]
async fn async_main(args: AppArgs, product_name: &str, copyright: &str) {
    info!("{}; {}", product_name, copyright);

    let store = Arc::new(
        ProgramStore::new(&PathBuf::from(&args.data_dir)).unwrap());

    let camera: SharedCamera =
        Arc::new(tokio::sync::Mutex::new(get_camera(&args.test_image)));
    let sim_io = SimIoHandle::new();
    let io: SharedIo = Arc::new(std::sync::Mutex::new(sim_io.backend()));

    let (events, _keepalive) = broadcast::channel::<ServerEvent>(256);
    let clock = Arc::new(SystemClock);
    let diagnostics = Arc::new(Diagnostics::new(events.clone(), clock.clone()));
    let sink = Arc::new(ResultSink::new(store.clone(), events.clone()));
    let controller = TriggerController::new(
        store.clone(), camera.clone(), io.clone(), sink.clone(),
        diagnostics.clone(), clock, events.clone());

    let state = Arc::new(ServerState {
        store,
        controller,
        camera,
        io,
        sink,
        diagnostics,
        events,
    });

    // Diagnostics flusher: batched, off the cycle hot path.
    {
        let store = state.store.clone();
        let diagnostics = state.diagnostics.clone();
        tokio::spawn(async move {
            let mut ticks =
                tokio::time::interval(Duration::from_secs(10));
            ticks.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let report = diagnostics.snapshot();
                match serde_json::to_string(&report) {
                    Ok(json) => {
                        if let Err(e) = store.save_diagnostics_snapshot(&json) {
                            warn!("Diagnostics flush failed: {}", e.message);
                        }
                    }
                    Err(e) => warn!("Diagnostics encode failed: {}", e),
                }
            }
        });
    }

    let app = build_router(state, &args.ui_dir);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Listening at {:?}", addr);
    hyper::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status(&CanonicalErrorCode::InvalidArgument),
                   StatusCode::BAD_REQUEST);
        assert_eq!(http_status(&CanonicalErrorCode::NotFound),
                   StatusCode::NOT_FOUND);
        // The "no mutation while running" rule surfaces as 409.
        assert_eq!(http_status(&CanonicalErrorCode::FailedPrecondition),
                   StatusCode::CONFLICT);
        assert_eq!(http_status(&CanonicalErrorCode::Unavailable),
                   StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(&CanonicalErrorCode::Internal),
                   StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_ws_op_parsing() {
        let op: WsOp =
            serde_json::from_str(r#"{"op":"start","program_id":3}"#).unwrap();
        assert_eq!(op.op, "start");
        assert_eq!(op.program_id, Some(3));

        let op: WsOp = serde_json::from_str(r#"{"op":"stop"}"#).unwrap();
        assert_eq!(op.program_id, None);

        assert!(serde_json::from_str::<WsOp>(r#"{"nope":1}"#).is_err());
    }

    #[test]
    fn test_io_write_request_line_names() {
        let request: IoWriteRequest = serde_json::from_str(
            r#"{"line":"OUT4","value":true}"#).unwrap();
        assert_eq!(request.line, OutputLine::Out4);
        assert!(request.line.operator_bound());

        let request: IoWriteRequest = serde_json::from_str(
            r#"{"line":"OUT1","value":false}"#).unwrap();
        assert!(!request.line.operator_bound());
    }
}  // mod tests.
