use utoipa::OpenApi;

use crate::api;
use crate::models;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::health,
        api::enqueue,
        api::queue_list,
        api::queue_remove,
        api::shuffle,
        api::set_loop_mode,
        api::skip,
        api::pause,
        api::resume,
        api::stop,
        api::now_playing,
        api::sessions_list,
    ),
    components(
        schemas(
            api::HealthResponse,
            models::EnqueueRequest,
            models::LoopModeRequest,
            models::LoopModeResponse,
            models::RemovedResponse,
            models::SkippedResponse,
            models::ShuffleResponse,
            models::NowPlayingResponse,
            models::SessionsResponse,
            jukebox_types::EnqueueReport,
            jukebox_types::QueueSnapshot,
            jukebox_types::TrackRequest,
            jukebox_types::NowPlaying,
            jukebox_types::LoopMode,
            jukebox_types::SessionStatus,
            jukebox_types::SessionPhase,
            jukebox_types::SessionKey,
            jukebox_types::ChannelRef,
        )
    ),
    tags(
        (name = "jukebox-server", description = "Session playback control API")
    )
)]
pub struct ApiDoc;
