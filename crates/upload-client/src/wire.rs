//! URL layout and response parsing for the upload service.
//!
//! ```text
//! PUT  {base}/upload/begin?uploadHandler={h}&{params...}    -> 200, body = bucket ID
//! GET  {base}/upload/{h}/{urlEncodedPath}?size={n}          -> 200, else body = reason
//! PUT  {base}/upload/{bucket}{targetPath}{uploadPath}?isDirectory={bool}
//! PUT  {base}/upload/{bucket}/commit                         -> 200/201/204, Location
//! ```

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters escaped in a single URL component (everything but
/// `A-Z a-z 0-9 - _ . ! ~ * ' ( )`).
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Query parameter carrying the server-side handler name.
pub const UPLOAD_HANDLER_PARAM: &str = "uploadHandler";

pub fn begin_url(base_url: &str) -> String {
    format!("{}/upload/begin", trim_base(base_url))
}

/// Pre-flight URL. The whole path is encoded as one component.
pub fn validate_url(base_url: &str, upload_handler: &str, path: &str) -> String {
    format!(
        "{}/upload/{}/{}",
        trim_base(base_url),
        encode_component(upload_handler),
        encode_component(path.trim_start_matches('/')),
    )
}

/// Per-entry URL. Each path segment is encoded separately so `/` survives.
pub fn transfer_url(base_url: &str, bucket_id: &str, target_path: &str, upload_path: &str) -> String {
    format!(
        "{}/upload/{}{}{}",
        trim_base(base_url),
        encode_component(bucket_id),
        encode_path(target_path),
        encode_path(upload_path),
    )
}

pub fn commit_url(base_url: &str, bucket_id: &str) -> String {
    format!(
        "{}/upload/{}/commit",
        trim_base(base_url),
        encode_component(bucket_id)
    )
}

/// Best-effort failure message: XML `message` element, then the plain
/// text body, then the HTTP status text.
pub fn error_message(body: &str, status_text: &str) -> String {
    if let Some(message) = xml_element_text(body, "message") {
        return message;
    }
    let text = body.trim();
    if !text.is_empty() && !text.starts_with('<') {
        return text.to_string();
    }
    status_text.to_string()
}

/// Returns the trimmed, unescaped text of the first `<name>` element
/// (namespace prefixes and attributes allowed), if non-empty.
fn xml_element_text(body: &str, name: &str) -> Option<String> {
    let mut rest = body;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let close = after.find('>')?;
        let tag = &after[..close];
        rest = &after[close + 1..];

        if tag.starts_with('/') || tag.starts_with('?') || tag.starts_with('!') || tag.ends_with('/') {
            continue;
        }
        let tag_name = tag.split_whitespace().next().unwrap_or_default();
        let local = tag_name.rsplit(':').next().unwrap_or(tag_name);
        if local != name {
            continue;
        }

        let end = rest.find(&format!("</{tag_name}"))?;
        let text = unescape(rest[..end].trim());
        return (!text.is_empty()).then_some(text);
    }
    None
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("/{}", encode_component(segment)))
        .collect()
}

fn trim_base(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}
