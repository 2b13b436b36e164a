//! Static dashboard files
//!
//! The dashboard is a plain HTML/JS client of the control API. When a static
//! directory is configured the control server hands every unmatched `GET` to
//! [`serve_static`].

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const INDEX_FILE: &str = "index.html";

/// Serve `request_path` from `root`
pub async fn serve_static(root: &Path, request_path: &str) -> Response<Full<Bytes>> {
    let Some(relative) = resolve_path(request_path) else {
        warn!(path = request_path, "Rejected static path");
        return not_found();
    };

    let full_path = root.join(&relative);
    match tokio::fs::read(&full_path).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type(&full_path))
            .body(Full::new(Bytes::from(contents)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                debug!(path = %full_path.display(), error = %e, "Failed to read static file");
            }
            not_found()
        }
    }
}

/// Map a URL path to a path relative to the static root
///
/// `/` maps to `index.html`. Anything that is not a plain sequence of
/// normal components (`..`, drive prefixes, backslashes) is refused.
pub fn resolve_path(request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Some(PathBuf::from(INDEX_FILE));
    }
    if trimmed.contains('\\') || trimmed.contains('\0') {
        return None;
    }

    let mut resolved = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if resolved.as_os_str().is_empty() {
        return None;
    }
    if request_path.ends_with('/') {
        resolved.push(INDEX_FILE);
    }
    Some(resolved)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from("not found")))
        .expect("valid response with StatusCode enum and static header")
}
