use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    VideoFeed,
    AudioFeed,
    PushToTalk,
}

impl SessionKind {
    pub const ALL: [SessionKind; 3] = [SessionKind::VideoFeed, SessionKind::AudioFeed, SessionKind::PushToTalk];
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::VideoFeed => write!(f, "video feed"),
            SessionKind::AudioFeed => write!(f, "audio feed"),
            SessionKind::PushToTalk => write!(f, "push-to-talk"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Error,
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Active)
    }
}
