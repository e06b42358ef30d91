// SPDX-License-Identifier: MIT
//! SSE bridge for node launch logs.
//!
//! `GET /admin/nodes/{id}/logs/stream`
//!
//! Replays the current log buffer, then forwards new entries from the event
//! bus as they are appended. A terminal phase (`active` or `failed`) closes
//! the stream.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::ApiError;
use crate::events::{kind, Event};
use crate::rest::extract::admin_auth;
use crate::rest::routes::admin_nodes::fetch_log_entries;
use crate::AppContext;

struct LogStream {
    node_id: String,
    backlog: VecDeque<Value>,
    rx: broadcast::Receiver<Event>,
    done: bool,
}

pub async fn node_logs_stream(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    admin_auth(&ctx, &headers)?;
    if ctx.registry.get(&node_id).await.is_none() {
        return Err(ApiError::NotFound("node".to_string()));
    }

    // Subscribe before reading the snapshot so no entry is lost in between.
    let rx = ctx.bus.subscribe();
    let backlog: VecDeque<Value> = fetch_log_entries(&ctx, &node_id, None, None)
        .await?
        .into();

    let state = LogStream {
        node_id,
        backlog,
        rx,
        done: false,
    };

    let s = stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }

        // Drain the snapshot first, then go live.
        if let Some(entry) = st.backlog.pop_front() {
            if is_terminal(&entry) {
                st.done = true;
            }
            return Some((make_event(&entry), st));
        }

        loop {
            match st.rx.recv().await {
                Ok(event) => {
                    if event.kind != kind::NODE_LAUNCH_LOG {
                        continue;
                    }
                    let matches = event
                        .payload
                        .get("node_id")
                        .and_then(|v| v.as_str())
                        .map(|id| id == st.node_id)
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                    let Some(entry) = event.payload.get("entry").cloned() else {
                        continue;
                    };
                    if is_terminal(&entry) {
                        st.done = true;
                    }
                    return Some((make_event(&entry), st));
                }
                // Lagged subscribers skip ahead; a closed bus ends the stream.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(s).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

fn is_terminal(entry: &Value) -> bool {
    matches!(
        entry.get("phase").and_then(|v| v.as_str()),
        Some("active") | Some("failed")
    )
}

fn make_event(entry: &Value) -> Result<SseEvent, std::convert::Infallible> {
    Ok(SseEvent::default()
        .event("log")
        .data(entry.to_string()))
}
