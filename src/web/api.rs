//! Defines the Axum API routes and handlers.

use crate::hardware::link::FirmwareLink;
use crate::print::{PrintError, PrintEvent, PrintHandle};
use crate::print_job::PrintJob;
use crate::web::models::{ErrorResponse, PrintStartedResponse, StatusResponse};
use async_stream::stream;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures_core::Stream;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;

#[derive(Clone)]
pub struct AppState {
    pub print: PrintHandle,
    pub link: FirmwareLink,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/print", post(start_print))
        .route("/api/v1/pause", post(pause))
        .route("/api/v1/resume", post(resume))
        .route("/api/v1/abort", post(abort))
        .route("/api/v1/dispensed", post(solution_dispensed))
        .route("/api/v1/events", get(events))
        .with_state(state)
}

fn api_error(e: PrintError) -> ApiError {
    let status = match e {
        PrintError::Busy | PrintError::NoJob | PrintError::InvalidTransition(_) => StatusCode::CONFLICT,
        PrintError::InvalidJob(_) => StatusCode::BAD_REQUEST,
        PrintError::ChannelSend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::debug!("API request failed ({}): {}", status, e);
    (status, Json(ErrorResponse { error: e.to_string() }))
}

/// Handler to get the current status of the print controller and firmware link.
async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        print: state.print.status(),
        link: state.link.status(),
    })
}

async fn start_print(
    State(state): State<AppState>,
    Json(job): Json<PrintJob>,
) -> Result<(StatusCode, Json<PrintStartedResponse>), ApiError> {
    let job_id = state.print.print(job).await.map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(PrintStartedResponse { job_id })))
}

async fn pause(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.print.pause().await.map_err(api_error)?;
    Ok(StatusCode::OK)
}

async fn resume(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.print.resume().await.map_err(api_error)?;
    Ok(StatusCode::OK)
}

async fn abort(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.print.abort().await.map_err(api_error)?;
    Ok(StatusCode::OK)
}

async fn solution_dispensed(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.print.solution_dispensed().await.map_err(api_error)?;
    Ok(StatusCode::OK)
}

/// Streams print events as Server-Sent Events, one JSON object per message.
async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut receiver = state.print.subscribe();
    let stream = stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => match sse_event(&event) {
                    Some(message) => yield Ok(message),
                    None => continue,
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event stream lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: &PrintEvent) -> Option<Event> {
    Event::default()
        .json_data(event)
        .map_err(|e| tracing::warn!("Failed to encode print event: {}", e))
        .ok()
}
