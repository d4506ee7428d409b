//! Link parsing, filename derivation and destination path helpers

use regex::Regex;
use std::sync::LazyLock;
use url::Url;

use crate::error::{Error, Result};
use crate::source::MediaInfo;
use crate::types::{ChatRef, MessageRef};

/// Longest filename kept verbatim; longer names are replaced with a timestamp
pub const MAX_FILENAME_LEN: usize = 100;

/// Names OneDrive refuses outright
const INVALID_NAMES: &[&str] = &[
    ".lock",
    "desktop.ini",
    "CON",
    "PRN",
    "AUX",
    "NUL",
    "COM0",
    "COM1",
    "COM2",
    "COM3",
    "COM4",
    "COM5",
    "COM6",
    "COM7",
    "COM8",
    "COM9",
    "LPT0",
    "LPT1",
    "LPT2",
    "LPT3",
    "LPT4",
    "LPT5",
    "LPT6",
    "LPT7",
    "LPT8",
    "LPT9",
];

/// Substrings OneDrive refuses anywhere in a name
const INVALID_COMPONENTS: &[&str] = &["\"", "*", ":", "<", ">", "?", "/", "\\", "|", "_vti_"];

/// Query parameters that commonly carry a download's filename
const FILENAME_PARAMS: &[&str] = &["name", "filename", "file_name", "title", "file"];

#[allow(clippy::expect_used)]
static CD_EXTENDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)filename\*\s*=\s*(?:[\w-]+'[\w-]*')?([^;]+)").expect("valid regex")
});

#[allow(clippy::expect_used)]
static CD_PLAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)filename\s*=\s*("[^"]*"|[^;]+)"#).expect("valid regex"));

/// Parse a `https://t.me/...` message link
///
/// `https://t.me/c/<chat_id>/<msg_id>` refers to a private chat by id;
/// `https://t.me/<username>/<msg_id>` to a public one. A trailing query string
/// (such as `?single`) is ignored.
pub fn parse_message_link(link: &str) -> Result<MessageRef> {
    let link = link.trim();
    let link = link.split(['?', '#']).next().unwrap_or(link);

    let (rest, is_private) = if let Some(rest) = link.strip_prefix("https://t.me/c/") {
        (rest, true)
    } else if let Some(rest) = link.strip_prefix("https://t.me/") {
        (rest, false)
    } else {
        return Err(Error::InvalidLink(format!("not a message link: {link}")));
    };

    let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    let [chat, message_id] = parts.as_slice() else {
        return Err(Error::InvalidLink(format!(
            "expected <chat>/<message id> in {link}"
        )));
    };

    let chat = if is_private {
        let id = chat
            .parse::<i64>()
            .map_err(|e| Error::InvalidLink(format!("invalid chat id '{chat}': {e}")))?;
        ChatRef::Id(id)
    } else {
        if chat.is_empty() {
            return Err(Error::InvalidLink(format!("missing username in {link}")));
        }
        ChatRef::Username((*chat).to_string())
    };

    let message_id = message_id
        .parse::<i32>()
        .map_err(|e| Error::InvalidLink(format!("invalid message id '{message_id}': {e}")))?;

    Ok(MessageRef::new(chat, message_id))
}

/// Render a message reference back into a `https://t.me/...` link
pub fn message_link(message: &MessageRef) -> String {
    match &message.chat {
        ChatRef::Id(id) => format!("https://t.me/c/{}/{}", id, message.message_id),
        ChatRef::Username(name) => format!("https://t.me/{}/{}", name, message.message_id),
    }
}

/// Whether OneDrive would accept this name
pub fn is_valid_filename(name: &str) -> bool {
    if name.trim().is_empty() || INVALID_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name)) {
        return false;
    }
    !INVALID_COMPONENTS.iter().any(|c| name.contains(c))
}

/// Extension of a filename without the dot, empty when there is none
pub fn extension_of(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => "",
    }
}

/// Extensions registered for a MIME type, ignoring parameters such as `charset`
pub fn guess_extensions(content_type: &str) -> Vec<String> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    mime_guess::get_mime_extensions_str(essence)
        .map(|exts| exts.iter().map(|e| (*e).to_string()).collect())
        .unwrap_or_default()
}

/// Filename for chat media
///
/// Photos are named `<id>.jpg`. Documents keep their own name when OneDrive accepts it,
/// otherwise they become `<id>.<ext>` with the extension taken from the name or MIME type.
pub fn media_filename(info: &MediaInfo) -> String {
    if info.is_photo {
        return format!("{}.jpg", info.file_id);
    }

    let name = info.file_name.as_deref().unwrap_or("").trim();
    if is_valid_filename(name) {
        let name = name.trim_start_matches("~$");
        if !name.is_empty() {
            return name.to_string();
        }
    }

    let ext = match extension_of(name) {
        "" => info
            .mime_type
            .as_deref()
            .and_then(|mime| guess_extensions(mime).into_iter().next())
            .unwrap_or_default(),
        ext => ext.to_string(),
    };
    if ext.is_empty() || !is_valid_filename(&ext) {
        info.file_id.to_string()
    } else {
        format!("{}.{}", info.file_id, ext)
    }
}

/// Filename carried by a `Content-Disposition` header
///
/// RFC 5987 `filename*=` takes precedence over plain `filename=`.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    if let Some(cap) = CD_EXTENDED.captures(header) {
        let raw = cap[1].trim().trim_matches('"');
        if let Ok(decoded) = urlencoding::decode(raw) {
            let decoded = decoded.trim().to_string();
            if !decoded.is_empty() {
                return Some(decoded);
            }
        }
    }

    let cap = CD_PLAIN.captures(header)?;
    let name = cap[1].trim().trim_matches('"').trim_matches('\'').trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Filename suggested by a URL: a well-known query parameter, then the last path segment
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;

    let from_query = parsed
        .query_pairs()
        .find(|(key, value)| {
            FILENAME_PARAMS.contains(&key.to_ascii_lowercase().as_str()) && !value.is_empty()
        })
        .map(|(_, value)| value.into_owned());
    if from_query.is_some() {
        return from_query;
    }

    let last = parsed.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string());
    (!decoded.trim().is_empty()).then_some(decoded)
}

/// Filename for a remote URL download
///
/// Takes the `Content-Disposition` name, then the URL-derived name, and appends an extension
/// inferred from `Content-Type` when the name lacks a matching one. Missing, over-long or
/// invalid names fall back to a Unix timestamp.
pub fn url_filename(
    url: &str,
    content_disposition: Option<&str>,
    content_type: Option<&str>,
) -> String {
    let named = content_disposition
        .and_then(filename_from_content_disposition)
        .or_else(|| filename_from_url(url));

    let content_type = content_type.unwrap_or("application/octet-stream");
    let exts = if content_type.starts_with("application/octet-stream") {
        Vec::new()
    } else {
        guess_extensions(content_type)
    };
    let timestamp = chrono::Utc::now().timestamp().to_string();

    let name = match named {
        Some(name) => {
            let ext = extension_of(&name).to_ascii_lowercase();
            let has_known_ext = exts.iter().any(|e| *e == ext);
            match (exts.first(), name.chars().count() < MAX_FILENAME_LEN) {
                (Some(first), true) if !has_known_ext => format!("{name}.{first}"),
                (_, true) => name,
                (Some(_), false) if has_known_ext => format!("{timestamp}.{ext}"),
                (Some(first), false) => format!("{timestamp}.{first}"),
                (None, false) => timestamp.clone(),
            }
        }
        None => match exts.first() {
            Some(first) => format!("{timestamp}.{first}"),
            None => timestamp.clone(),
        },
    };

    if is_valid_filename(&name) {
        let trimmed = name.trim().trim_start_matches("~$");
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    match extension_of(&name) {
        "" => timestamp,
        ext if is_valid_filename(ext) => format!("{timestamp}.{ext}"),
        _ => timestamp,
    }
}

/// Join the destination root, an optional sub-directory and a filename into a drive path
///
/// Backslashes become forward slashes, empty and `.`/`..` segments are dropped and the result
/// always starts with `/`.
pub fn destination_path(root: &str, directory: Option<&str>, filename: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    let root = root.replace('\\', "/");
    let directory = directory.map(|d| d.replace('\\', "/")).unwrap_or_default();

    for part in root.split('/').chain(directory.split('/')) {
        let part = part.trim();
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        segments.push(part);
    }

    let mut path = String::from("/");
    for segment in segments {
        path.push_str(segment);
        path.push('/');
    }
    path.push_str(filename.trim_matches('/'));
    path
}
