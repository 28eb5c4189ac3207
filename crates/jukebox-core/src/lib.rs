//! Per-session playback orchestration.
//!
//! Sessions are independent actors keyed by [`jukebox_types::SessionKey`];
//! [`PlaybackManager`] is the entry point for command surfaces.

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod playback_manager;
pub mod queue_state;
pub mod resolver;
pub mod session_registry;
pub mod transport;

pub use error::PlaybackError;
pub use events::{EventBus, SessionEvent};
pub use orchestrator::{PlaybackSettings, SessionHandle};
pub use playback_manager::PlaybackManager;
pub use queue_state::{QueueError, QueueState};
pub use resolver::{Lookup, LookupEntry, ResolveBackend, ResolveError, Resolver};
pub use session_registry::SessionRegistry;
pub use transport::{CompletionCallback, SinkHandle, TransportError, TransportSink};
