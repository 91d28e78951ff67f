use thiserror::Error;

/// Recoverable failures inside the bridge pipeline.
///
/// None of these are fatal to the process: every caller logs the error and
/// keeps serving subsequent hooks and messages.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An identity fetch failed or returned unusable data. Mention tokens
    /// referencing the id stay unexpanded and payloads carry a null author.
    #[error("could not resolve identity '{id}': {reason}")]
    UnresolvedIdentity { id: String, reason: String },

    /// An outbound send target is neither a known channel name nor a raw id
    /// with a recognized type marker.
    #[error("unknown channel '{0}'")]
    UnknownChannelTarget(String),

    /// A hook responded with something other than a JSON object carrying a
    /// string `content` field.
    #[error("hook at {url} did not send back a usable object")]
    MalformedHookResponse { url: String },

    /// Transport-level delivery failure. No retry is attempted.
    #[error("delivery to {url} failed: {reason}")]
    HookDeliveryFailure { url: String, reason: String },
}
