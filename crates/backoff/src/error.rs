use thiserror::Error;

/// Failure talking to an upstream service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid payload: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Status errors keep at most this many bytes of the response body.
    pub const MAX_BODY: usize = 512;

    pub fn status(code: u16, body: impl Into<String>) -> Self {
        let mut body = body.into();
        if body.len() > Self::MAX_BODY {
            let mut cut = Self::MAX_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Self::Status { code, body }
    }
}
