//! Well-known payload metadata keys.

pub const FILENAME: &str = "filename";
pub const MIME: &str = "mime";
pub const WIDTH: &str = "width";
pub const HEIGHT: &str = "height";
/// Hex SHA-256 of the plaintext content; used for echo suppression.
pub const CONTENT_HASH: &str = "content_hash";
pub const SENDER_NAME: &str = "sender_name";
pub const SENDER_PLATFORM: &str = "sender_platform";
