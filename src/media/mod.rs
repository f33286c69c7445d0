//! Media sessions against the edge multimedia server: live video and audio
//! feeds, push-to-talk, and reachability probing.

#[cfg(feature = "native-audio")]
pub mod capture;
#[cfg(feature = "native-audio")]
pub mod encode;
mod endpoints;
mod host;
mod manager;
pub mod mjpeg;
mod probe;
mod session;
mod transport;

pub use endpoints::MediaEndpoints;
pub use host::{
    CaptureDevice, CaptureSource, DesktopHost, FileCapture, MediaHost, PlaybackSink, SinkKind, bytes_per_slice,
    is_webm,
};
pub use manager::MediaSessionManager;
pub use probe::ReachabilityProbe;
pub use session::{SessionKind, SessionState};
pub use transport::{ByteStream, ChunkSink, HttpMediaTransport, MediaTransport};
