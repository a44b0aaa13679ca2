use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::{Caller, GatewayState};

/// GET /api/events: domain events as server-sent events, in feed order.
///
/// Each SSE message carries the event type as `event:` and the feed
/// sequence number as `id:`. Events about conversations the caller cannot
/// read are skipped, so `id:` values may have gaps. A subscriber that
/// falls behind gets a `lagged` message with the number of skipped events
/// and continues.
pub async fn stream_events(
    State(state): State<GatewayState>,
    caller: Caller,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("event stream opened: agent={}", caller.principal.agent_id);
    let rx = state.console.feed().subscribe();
    let principal = caller.principal;

    let stream = stream::unfold(
        (rx, state, principal),
        |(mut rx, state, principal)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !state
                        .console
                        .router()
                        .can_observe(&principal, &event.event)
                        .await
                    {
                        continue;
                    }
                    let message = Event::default()
                        .event(event.event.name())
                        .id(event.seq.to_string())
                        .json_data(&event);
                    match message {
                        Ok(message) => return Some((Ok(message), (rx, state, principal))),
                        Err(e) => warn!("failed to encode event seq={}: {}", event.seq, e),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event stream lagged, skipped {} events", skipped);
                    let message = Event::default().event("lagged").data(skipped.to_string());
                    return Some((Ok(message), (rx, state, principal)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}
