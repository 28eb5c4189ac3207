//! Session playback API handlers.

use std::time::{SystemTime, UNIX_EPOCH};

use actix_web::{HttpResponse, Responder, delete, get, post, web};
use jukebox_types::{ChannelRef, EnqueueReport, QueueSnapshot, SessionKey};

use crate::api::IntoHttpResponse;
use crate::models::{
    EnqueueRequest, LoopModeRequest, LoopModeResponse, NowPlayingResponse, RemovedResponse,
    SessionsResponse, ShuffleResponse, SkippedResponse,
};
use crate::state::AppState;

fn session_key(path: web::Path<String>) -> SessionKey {
    SessionKey::new(path.into_inner())
}

#[utoipa::path(
    post,
    path = "/sessions/{key}/queue",
    params(("key" = String, Path, description = "Session key")),
    request_body = EnqueueRequest,
    responses(
        (status = 200, description = "Tracks queued", body = EnqueueReport),
        (status = 400, description = "Missing query"),
        (status = 404, description = "No results"),
        (status = 409, description = "Requester not in a channel or session stopped"),
        (status = 502, description = "Lookup or transport failure")
    )
)]
#[post("/sessions/{key}/queue")]
/// Resolve a query and append the tracks to the session queue.
pub async fn enqueue(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<EnqueueRequest>,
) -> impl Responder {
    let key = session_key(path);
    let req = body.into_inner();
    let query = req.query.trim();
    if query.is_empty() {
        return HttpResponse::BadRequest().body("query is required");
    }
    let channel = req
        .channel
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(ChannelRef::new);
    match state
        .playback
        .enqueue(&key, channel, query, req.requested_by.trim())
        .await
    {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/sessions/{key}/queue",
    params(("key" = String, Path, description = "Session key")),
    responses(
        (status = 200, description = "Queue contents", body = QueueSnapshot)
    )
)]
#[get("/sessions/{key}/queue")]
/// Return the pending tracks, loop mode and now-playing record.
pub async fn queue_list(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.playback.list_queue(&session_key(path)).await {
        Ok(snapshot) => HttpResponse::Ok().json(snapshot),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/sessions/{key}/queue/{position}",
    params(
        ("key" = String, Path, description = "Session key"),
        ("position" = usize, Path, description = "1-based queue position")
    ),
    responses(
        (status = 200, description = "Track removed", body = RemovedResponse),
        (status = 400, description = "Position out of range"),
        (status = 409, description = "No live session")
    )
)]
#[delete("/sessions/{key}/queue/{position}")]
/// Remove the pending track at a 1-based position.
pub async fn queue_remove(
    state: web::Data<AppState>,
    path: web::Path<(String, usize)>,
) -> impl Responder {
    let (key, position) = path.into_inner();
    match state
        .playback
        .remove_at(&SessionKey::new(key), position)
        .await
    {
        Ok(removed) => HttpResponse::Ok().json(RemovedResponse { removed }),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/sessions/{key}/shuffle",
    params(("key" = String, Path, description = "Session key")),
    responses(
        (status = 200, description = "Queue shuffled", body = ShuffleResponse),
        (status = 409, description = "Queue empty or no live session")
    )
)]
#[post("/sessions/{key}/shuffle")]
/// Shuffle the pending tracks.
pub async fn shuffle(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.playback.shuffle(&session_key(path)).await {
        Ok(shuffled) => HttpResponse::Ok().json(ShuffleResponse { shuffled }),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/sessions/{key}/loop",
    params(("key" = String, Path, description = "Session key")),
    request_body = LoopModeRequest,
    responses(
        (status = 200, description = "Loop mode set", body = LoopModeResponse),
        (status = 409, description = "No live session")
    )
)]
#[post("/sessions/{key}/loop")]
pub async fn set_loop_mode(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<LoopModeRequest>,
) -> impl Responder {
    match state
        .playback
        .set_loop_mode(&session_key(path), body.mode)
        .await
    {
        Ok(mode) => HttpResponse::Ok().json(LoopModeResponse { mode }),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/sessions/{key}/skip",
    params(("key" = String, Path, description = "Session key")),
    responses(
        (status = 200, description = "Track skipped", body = SkippedResponse),
        (status = 409, description = "Nothing playing")
    )
)]
#[post("/sessions/{key}/skip")]
/// Stop the current track and advance.
pub async fn skip(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.playback.skip(&session_key(path)).await {
        Ok(skipped) => HttpResponse::Ok().json(SkippedResponse { skipped }),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/sessions/{key}/pause",
    params(("key" = String, Path, description = "Session key")),
    responses(
        (status = 200, description = "Playback paused"),
        (status = 409, description = "Nothing playing")
    )
)]
#[post("/sessions/{key}/pause")]
pub async fn pause(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.playback.pause(&session_key(path)).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/sessions/{key}/resume",
    params(("key" = String, Path, description = "Session key")),
    responses(
        (status = 200, description = "Playback resumed"),
        (status = 409, description = "Not paused")
    )
)]
#[post("/sessions/{key}/resume")]
pub async fn resume(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.playback.resume(&session_key(path)).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/sessions/{key}/stop",
    params(("key" = String, Path, description = "Session key")),
    responses(
        (status = 200, description = "Session stopped"),
        (status = 409, description = "No live session")
    )
)]
#[post("/sessions/{key}/stop")]
/// Clear the queue, reset loop mode and disconnect.
pub async fn stop(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.playback.stop(&session_key(path)).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/sessions/{key}/now-playing",
    params(("key" = String, Path, description = "Session key")),
    responses(
        (status = 200, description = "Current track, if any", body = NowPlayingResponse)
    )
)]
#[get("/sessions/{key}/now-playing")]
pub async fn now_playing(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    match state.playback.now_playing(&session_key(path)).await {
        Ok(now_playing) => {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            let elapsed_ms = now_playing.as_ref().map(|n| n.elapsed_ms(now_ms));
            HttpResponse::Ok().json(NowPlayingResponse {
                now_playing,
                elapsed_ms,
            })
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Live sessions", body = SessionsResponse)
    )
)]
#[get("/sessions")]
/// List live sessions.
pub async fn sessions_list(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(SessionsResponse {
        sessions: state.playback.sessions().await,
    })
}
