use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderValue,
    middleware::from_fn,
    response::Response,
    routing::get,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt::Display;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::ServiceError;
use crate::evidence::PubMedRetriever;
use crate::fhir::{FhirClient, RecordServer};
use crate::llm::OpenRouterModel;
use crate::models::{DoctorQuery, ResponseMode};
use crate::orchestrator::{FrameStream, Orchestrator};
use crate::records::{
    ConditionsService, DEFAULT_CONDITION_COUNT, DEFAULT_ENCOUNTER_COUNT, EncountersService, PatientsService,
};
use crate::telemetry::correlation_id_middleware;

type ApiResult<T> = Result<Json<T>, ServiceError>;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub patients: PatientsService,
    pub encounters: EncountersService,
    pub conditions: ConditionsService,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, records: Arc<dyn RecordServer>) -> Self {
        Self {
            orchestrator,
            patients: PatientsService::new(records.clone()),
            encounters: EncountersService::new(records.clone()),
            conditions: ConditionsService::new(records),
        }
    }
}

/// Construct every provider and the router. Any provider failure is fatal.
pub async fn create_app(settings: &Settings) -> Result<Router, ServiceError> {
    let records = Arc::new(FhirClient::connect(&settings.fhir).await?);
    let model = Arc::new(OpenRouterModel::new(&settings.model)?);
    let evidence = Arc::new(PubMedRetriever::new(&settings.retriever)?);

    let orchestrator = Orchestrator::new(model, evidence, records.clone());
    Ok(build_router(AppState::new(orchestrator, records), settings))
}

pub fn build_router(state: AppState, settings: &Settings) -> Router {
    let api = Router::new()
        .route("/healthy", get(health_check))
        .route("/patients", get(list_patients))
        .route("/patients/{patient_id}", get(get_patient))
        .route("/encounters/recent/patients/{patient_id}", get(recent_encounters))
        .route("/conditions/latest/patients/{patient_id}", get(latest_conditions))
        .route("/medical-qa-assistant/general/ws", get(general_ws))
        .route("/medical-qa-assistant/patient/{patient_id}/ws", get(patient_ws));

    Router::new()
        .route("/", get(root))
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(correlation_id_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&settings.cors_allowed_origins)),
        )
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Medical QA Service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /api/v1/healthy": "Health check",
            "GET /api/v1/patients": "List patients",
            "GET /api/v1/patients/{patient_id}": "Get one patient",
            "GET /api/v1/encounters/recent/patients/{patient_id}?count=N": "Most recent encounters of a patient",
            "GET /api/v1/conditions/latest/patients/{patient_id}?count=N": "Latest conditions of a patient",
            "WS /api/v1/medical-qa-assistant/general/ws?response_mode=NORMAL|STREAM": "General medical QA",
            "WS /api/v1/medical-qa-assistant/patient/{patient_id}/ws": "Patient-scoped medical QA"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "Healthy" }))
}

#[derive(Debug, Deserialize)]
struct CountParams {
    count: Option<usize>,
}

async fn list_patients(State(state): State<AppState>) -> ApiResult<Vec<Value>> {
    Ok(Json(state.patients.get_many().await?))
}

async fn get_patient(State(state): State<AppState>, Path(patient_id): Path<String>) -> ApiResult<Value> {
    Ok(Json(state.patients.get_one(&patient_id).await?))
}

async fn recent_encounters(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
    Query(params): Query<CountParams>,
) -> ApiResult<Vec<Value>> {
    let count = params.count.unwrap_or(DEFAULT_ENCOUNTER_COUNT);
    Ok(Json(state.encounters.recent(&patient_id, count).await?))
}

async fn latest_conditions(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
    Query(params): Query<CountParams>,
) -> ApiResult<Vec<Value>> {
    let count = params.count.unwrap_or(DEFAULT_CONDITION_COUNT);
    Ok(Json(state.conditions.latest(&patient_id, count).await?))
}

/// What a WebSocket connection is for, fixed when it is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversation {
    General(ResponseMode),
    Patient(String),
}

/// Reply to one inbound message.
pub enum Outbound {
    Message(String),
    Stream(FrameStream),
}

#[derive(Debug, Deserialize)]
struct ModeParams {
    response_mode: Option<String>,
}

fn response_mode(raw: Option<&str>) -> ResponseMode {
    match raw {
        None => ResponseMode::default(),
        Some(value) => ResponseMode::parse(value).unwrap_or_else(|| {
            warn!(response_mode = %value, "Unknown response mode, falling back to NORMAL");
            ResponseMode::Normal
        }),
    }
}

async fn general_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ModeParams>,
) -> Response {
    let conversation = Conversation::General(response_mode(params.response_mode.as_deref()));
    ws.on_upgrade(move |socket| serve_socket(socket, state.orchestrator, conversation))
}

async fn patient_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> Response {
    let conversation = Conversation::Patient(patient_id);
    ws.on_upgrade(move |socket| serve_socket(socket, state.orchestrator, conversation))
}

/// Answer one inbound text message.
///
/// A message that is not a valid question, or a request that fails before any
/// output was produced, is answered with an error frame.
pub async fn dispatch(orchestrator: &Orchestrator, conversation: &Conversation, text: &str) -> Outbound {
    let query: DoctorQuery = match serde_json::from_str(text) {
        Ok(query) => query,
        Err(e) => {
            warn!(error = %e, "Rejected malformed message");
            return Outbound::Message(ServiceError::BadRequest(format!("malformed message: {}", e)).error_frame());
        }
    };

    let outcome = match conversation {
        Conversation::General(ResponseMode::Stream) => orchestrator
            .general_medical_qa_chat_stream(&query)
            .await
            .map(Outbound::Stream),
        Conversation::General(ResponseMode::Normal) => orchestrator
            .general_medical_qa_chat(&query)
            .await
            .and_then(|response| Ok(Outbound::Message(serde_json::to_string(&response)?))),
        Conversation::Patient(patient_id) => orchestrator
            .patient_medical_qa_chat(patient_id, &query)
            .await
            .and_then(|response| Ok(Outbound::Message(serde_json::to_string(&response)?))),
    };

    outcome.unwrap_or_else(|e| {
        warn!(error = %e, "Request failed");
        Outbound::Message(e.error_frame())
    })
}

async fn serve_socket(socket: WebSocket, orchestrator: Orchestrator, conversation: Conversation) {
    let (mut outbound, inbound) = socket.split();
    serve_connection(inbound, &mut outbound, &orchestrator, &conversation).await;
}

/// Answer inbound messages one at a time until the client closes or goes away.
pub async fn serve_connection<R, W, E>(
    mut inbound: R,
    outbound: &mut W,
    orchestrator: &Orchestrator,
    conversation: &Conversation,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    W: Sink<Message> + Unpin,
{
    info!(conversation = ?conversation, "WebSocket connected");

    while let Some(frame) = inbound.next().await {
        let reply = match frame {
            Ok(Message::Text(text)) => dispatch(orchestrator, conversation, text.as_str()).await,
            Ok(Message::Binary(_)) => {
                warn!("Rejected binary message");
                Outbound::Message(
                    ServiceError::BadRequest("malformed message: expected a JSON text frame".to_string()).error_frame(),
                )
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                info!(error = %e, "WebSocket receive failed");
                break;
            }
        };

        let delivered = match reply {
            Outbound::Message(message) => outbound.send(Message::Text(message.into())).await.is_ok(),
            Outbound::Stream(frames) => forward_stream(outbound, frames).await,
        };
        if !delivered {
            break;
        }
    }

    info!(conversation = ?conversation, "WebSocket disconnected");
}

/// Send frames one at a time in arrival order. Returns false once the client is gone.
async fn forward_stream<W>(outbound: &mut W, mut frames: FrameStream) -> bool
where
    W: Sink<Message> + Unpin,
{
    let mut sent = 0usize;
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => {
                if outbound.send(Message::Text(frame.into())).await.is_err() {
                    info!(sent = sent, "Client left during stream; stopping");
                    return false;
                }
                sent += 1;
            }
            Err(e) => {
                warn!(error = %e, sent = sent, "Stream ended with an error");
                break;
            }
        }
    }
    debug!(sent = sent, "Stream finished");
    true
}
