//! Content types of the binary cache protocol.

/// Narinfo responses.
pub const NAR_INFO: &str = "text/x-nix-narinfo";

/// `/nix-cache-info` responses.
pub const NIX_CACHE_INFO: &str = "text/plain";

/// NAR archive responses.
pub const NAR: &str = "text/plain";

/// Build log responses.
pub const BUILD_LOG: &str = "text/plain";
