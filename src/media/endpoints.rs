use crate::utils::trim_trailing_slash;

/// URLs of the edge multimedia server, derived from one base address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEndpoints {
    base: String,
}

impl MediaEndpoints {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: trim_trailing_slash(base_url).to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `multipart/x-mixed-replace` JPEG stream.
    pub fn video(&self) -> String {
        format!("{}/video", self.base)
    }

    pub fn audio(&self) -> String {
        format!("{}/audio", self.base)
    }

    pub fn health(&self) -> String {
        format!("{}/health", self.base)
    }

    /// Push-to-talk WebSocket, same host with the scheme swapped.
    pub fn push_to_talk(&self) -> String {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base.clone()
        };
        format!("{}/ws/audio", ws_base)
    }
}
