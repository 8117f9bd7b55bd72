use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Link,
    Image,
    File,
}

impl ContentType {
    /// Text-like content is encoded as UTF-8; the rest carries raw bytes
    /// plus metadata (filename, mime, dimensions).
    pub fn is_textual(&self) -> bool {
        matches!(self, ContentType::Text | ContentType::Link)
    }
}

impl Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Text => write!(f, "text"),
            ContentType::Link => write!(f, "link"),
            ContentType::Image => write!(f, "image"),
            ContentType::File => write!(f, "file"),
        }
    }
}
