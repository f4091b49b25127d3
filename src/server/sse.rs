//! Per-run progress stream over server-sent events.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::api::{ApiError, SharedState};
use crate::orchestrator::RunEvent;

fn to_sse(event: &RunEvent) -> Option<Event> {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            tracing::warn!(run_id = event.run_id(), error = %e, "Failed to encode run event");
            None
        }
    }
}

/// Stream a run's events until its terminal event. A run that already
/// finished yields its terminal event from the stored state and closes.
pub async fn run_stream(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events: BoxStream<'static, RunEvent> = match state.orchestrator.events().subscribe_run(id) {
        Some(rx) => BroadcastStream::new(rx)
            .filter_map(move |item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(run_id = id, skipped, "SSE subscriber lagged");
                        None
                    }
                }
            })
            .boxed(),
        None => {
            let run = state
                .orchestrator
                .db()
                .call(move |db| db.get_run(id))
                .await
                .map_err(|e| ApiError::Internal(format!("{:#}", e)))?
                .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
            if !run.status.is_terminal() {
                return Err(ApiError::Conflict(format!(
                    "Run {} is not executing in this process",
                    id
                )));
            }
            stream::once(async move { RunEvent::terminal_for(run) }).boxed()
        }
    };

    let stream = events
        .filter_map(|event| async move { to_sse(&event) })
        .map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
