#![forbid(unsafe_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use listener_adapter::{
    init_tracing, wall_clock_now, AdapterConfig, AdapterFailure, AdapterHealthResponse,
    AdapterRuntime, TurnAdapterRequest, TurnAdapterResponse, VoiceNoteAdapterRequest,
    VOICE_NOTE_BODY_LIMIT_BYTES,
};
use tracing::{error, info};

type Reply = (StatusCode, Json<TurnAdapterResponse>);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AdapterConfig::from_env();
    init_tracing(config.log_json);
    let addr: SocketAddr = config.bind.parse()?;

    let runtime = Arc::new(AdapterRuntime::default_from_env(&config)?);
    let sweeper = {
        let runtime = Arc::clone(&runtime);
        let interval_ms = config.sweep_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                match runtime.run_maintenance_pass(wall_clock_now()).await {
                    Ok(0) => {}
                    Ok(archived) => info!(archived, "maintenance pass archived idle sessions"),
                    Err(err) => error!(error = %err, "maintenance pass failed"),
                }
            }
        })
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/turn", post(run_turn))
        .route(
            "/v1/voice-note",
            post(run_voice_note).layer(DefaultBodyLimit::max(VOICE_NOTE_BODY_LIMIT_BYTES)),
        )
        .with_state(Arc::clone(&runtime));

    info!(%addr, sweep_interval_ms = config.sweep_interval_ms, "listener_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    sweeper.abort();
    if let Err(err) = runtime.run_maintenance_pass(wall_clock_now()).await {
        error!(error = %err, "final store flush failed");
    }
    Ok(())
}

async fn healthz(State(runtime): State<Arc<AdapterRuntime>>) -> Json<AdapterHealthResponse> {
    Json(runtime.health_report())
}

async fn run_turn(
    State(runtime): State<Arc<AdapterRuntime>>,
    headers: HeaderMap,
    Json(request): Json<TurnAdapterRequest>,
) -> Reply {
    let user_id = match runtime.authenticate(authorization(&headers)).await {
        Ok(user_id) => user_id,
        Err(failure) => return failure_reply(failure),
    };
    match runtime
        .run_text_turn(&user_id, request, wall_clock_now())
        .await
    {
        Ok(response) => ok_reply(response),
        Err(failure) => failure_reply(failure),
    }
}

async fn run_voice_note(
    State(runtime): State<Arc<AdapterRuntime>>,
    headers: HeaderMap,
    Json(request): Json<VoiceNoteAdapterRequest>,
) -> Reply {
    let user_id = match runtime.authenticate(authorization(&headers)).await {
        Ok(user_id) => user_id,
        Err(failure) => return failure_reply(failure),
    };
    match runtime
        .run_voice_note(&user_id, request, wall_clock_now())
        .await
    {
        Ok(response) => ok_reply(response),
        Err(failure) => failure_reply(failure),
    }
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

fn ok_reply(response: TurnAdapterResponse) -> Reply {
    let status = StatusCode::from_u16(AdapterRuntime::http_status_for_response(&response))
        .unwrap_or(StatusCode::OK);
    (status, Json(response))
}

fn failure_reply(failure: AdapterFailure) -> Reply {
    let status =
        StatusCode::from_u16(failure.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(failure.body))
}
