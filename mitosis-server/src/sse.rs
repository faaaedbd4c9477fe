//! Server-Sent Events fallback for clients without WebSocket support.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use mitosis::broadcast::EventBroadcaster;
use tracing::debug;

use crate::state::AppState;

/// GET /api/agent/events/:task_id - stream of that task's events only.
pub async fn events_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state.events().clone();
    let mut subscription = events.connect();
    // A fresh connection cannot be closed yet.
    let _ = events.subscribe(subscription.id, &task_id);
    let guard = Disconnect {
        events,
        connection: subscription.id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        let hello = serde_json::json!({ "task_id": task_id }).to_string();
        yield Ok(Event::default().event("connected").data(hello));

        while let Some(event) = subscription.events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                yield Ok(Event::default().event(event.event.as_str()).data(json));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

/// Leaves the broadcaster when the client goes away and the stream is dropped.
struct Disconnect {
    events: std::sync::Arc<EventBroadcaster>,
    connection: u64,
}

impl Drop for Disconnect {
    fn drop(&mut self) {
        self.events.disconnect(self.connection);
        debug!(connection = self.connection, "sse client disconnected");
    }
}
