//! File extension → `Content-Type` mapping used by static resource serving.

/// Content type for bodies whose type is unknown.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Default content type of a response before any processor sets one.
pub const TEXT_HTML_UTF8: &str = "text/html; charset=UTF-8";

/// Content type of urlencoded form submissions.
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

pub const APPLICATION_JSON: &str = "application/json";

/// Returns the content type registered for a file extension (without the dot),
/// compared case-insensitively.
pub fn from_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.to_ascii_lowercase();
    Some(match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => APPLICATION_JSON,
        "txt" => "text/plain",
        "xml" => "text/xml",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "wasm" => "application/wasm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        _ => return None,
    })
}

/// Returns the content type for a resource path, falling back to
/// [`OCTET_STREAM`] when the extension is missing or unknown.
pub fn for_path(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.')
        .and_then(|(_, ext)| from_extension(ext))
        .unwrap_or(OCTET_STREAM)
}
