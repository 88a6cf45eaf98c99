use crate::server::error_response;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream, StreamExt};
use maestro_session::SessionStore;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub session_id: Uuid,
    /// Resume point from a previous connection; events still retained in
    /// the queue are replayed from here.
    #[serde(default)]
    pub cursor: u64,
}

struct StreamState {
    sessions: Arc<SessionStore>,
    session_id: Uuid,
    cursor: u64,
    cancel: CancellationToken,
    done: bool,
}

/// Server-sent events tied to one session. Emits events in order until a
/// terminal event; each event's SSE id is its queue sequence number, so a
/// reconnect with `cursor` resumes from the last-delivered position.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Response {
    if let Err(e) = state.sessions.get(query.session_id).await {
        return error_response(&e);
    }

    let stream_state = StreamState {
        sessions: state.sessions.clone(),
        session_id: query.session_id,
        cursor: query.cursor,
        cancel: CancellationToken::new(),
        done: false,
    };

    Sse::new(event_stream(stream_state))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn event_stream(initial: StreamState) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(initial, |mut st| async move {
        if st.done {
            return None;
        }
        let (batch, next) = st
            .sessions
            .dequeue_events(st.session_id, st.cursor, &st.cancel)
            .await
            .ok()?;
        if batch.is_empty() {
            // Cancelled pull: the client went away.
            return None;
        }
        st.cursor = next;

        let mut out: Vec<Result<Event, Infallible>> = Vec::with_capacity(batch.len());
        for queued in batch {
            let terminal = queued.event.is_terminal();
            let data = serde_json::to_string(&queued.event).unwrap_or_else(|_| "{}".to_string());
            out.push(Ok(Event::default()
                .id(queued.seq.to_string())
                .event(queued.event.kind())
                .data(data)));
            if terminal {
                st.done = true;
                break;
            }
        }
        Some((stream::iter(out), st))
    })
    .flatten()
}
