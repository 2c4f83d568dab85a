//! Per-session SSE feed.
//!
//! Driven by polling the session record at a fixed 1s interval and diffing
//! against the last observed status/step. Dropping the response stream (on
//! client disconnect) drops both timers with it, so closed connections leak
//! nothing.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use futures::Stream;
use serde_json::json;
use tracing::debug;

use lablite::session::{LabSession, SessionStatus};

use super::ApiError;
use crate::AppState;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let initial = state.manager.get_session(&id)?;
    let manager = state.manager.clone();

    let stream = async_stream::stream! {
        let mut last_status = initial.status;
        let mut last_step = initial.current_step_index;

        yield Ok(status_event(&initial));
        if last_status.is_terminal() {
            yield Ok(terminal_event(&initial));
            return;
        }

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        // Both intervals fire immediately on the first tick; swallow them so
        // the feed starts quiet after the initial status event.
        poll.tick().await;
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let Ok(session) = manager.get_session(&id) else {
                        debug!(session_id = %id, "session vanished, closing event feed");
                        break;
                    };

                    if session.current_step_index != last_step {
                        last_step = session.current_step_index;
                        yield Ok(step_event(&session));
                    }

                    if session.status != last_status {
                        last_status = session.status;
                        if session.status.is_terminal() {
                            yield Ok(terminal_event(&session));
                            break;
                        }
                        yield Ok(status_event(&session));
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default().event("heartbeat").data("{}"));
                }
            }
        }
    };

    Ok(Sse::new(stream))
}

fn status_event(session: &LabSession) -> Event {
    Event::default().event("status").data(
        json!({
            "status": session.status,
            "currentStepIndex": session.current_step_index,
        })
        .to_string(),
    )
}

fn step_event(session: &LabSession) -> Event {
    let step = &session.plan.steps[session.current_step_index];
    Event::default().event("step").data(
        json!({
            "stepIndex": step.index,
            "title": step.title,
            "instructions": step.instructions,
        })
        .to_string(),
    )
}

/// Terminal statuses close the feed with a matching named event.
fn terminal_event(session: &LabSession) -> Event {
    match session.status {
        SessionStatus::Completed => Event::default().event("completed").data(
            json!({
                "status": session.status,
                "completedAt": session.completed_at.map(|t| t.to_rfc3339()),
            })
            .to_string(),
        ),
        SessionStatus::Expired => Event::default().event("expired").data(
            json!({
                "status": session.status,
                "expiresAt": session.expires_at.to_rfc3339(),
            })
            .to_string(),
        ),
        SessionStatus::Failed => Event::default().event("error").data(
            json!({
                "status": session.status,
                "message": "sandbox provisioning failed",
            })
            .to_string(),
        ),
        _ => Event::default().event("status").data(
            json!({
                "status": session.status,
                "currentStepIndex": session.current_step_index,
            })
            .to_string(),
        ),
    }
}
