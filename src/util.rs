//! Name sanitizing and token allocation.

use std::path::Path;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use uuid::Uuid;

/// Longest accepted sanitized name; anything beyond is truncated.
const MAX_NAME_LEN: usize = 100;

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[<>:"/\\|?*]"#).expect("invalid sanitizer pattern"))
}

/// Make a user-supplied name safe to use as a single path component.
pub fn sanitize(name: &str) -> String {
    let cleaned = unsafe_chars().replace_all(name.trim(), "_");
    cleaned.chars().take(MAX_NAME_LEN).collect()
}

/// Random single-use token: 8 hex chars of a v4 UUID.
pub fn short_token() -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(8);
    token
}

/// Unique stream identifier derived from the user-supplied name.
pub fn allocate_stream_id(name: &str) -> String {
    format!("{}_{}", sanitize(name), short_token())
}

/// Filename for a staged upload. The timestamp prefix keeps two uploads
/// sharing an original filename from colliding.
pub fn staged_file_name(original: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}_{}", millis, sanitize(original))
}

/// Reject path components that could escape their parent directory.
pub fn path_component_is_safe(component: &str) -> bool {
    if component.is_empty() || component.contains("..") {
        return false;
    }
    // Exactly one normal component: no separators, no root, no parent dirs.
    let mut parts = Path::new(component).components();
    matches!(
        (parts.next(), parts.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize("a<b>c:d\"e/f\\g|h?i*j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize("  plain name  "), "plain name");
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "x".repeat(500);
        assert_eq!(sanitize(&long).len(), MAX_NAME_LEN);
    }

    #[test]
    fn stream_id_has_sanitized_prefix_and_token() {
        let id = allocate_stream_id("demo");
        assert!(id.starts_with("demo_"));
        assert_eq!(id.len(), "demo_".len() + 8);
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(short_token(), short_token());
    }

    #[test]
    fn safe_path_components() {
        assert!(path_component_is_safe("index.m3u8"));
        assert!(path_component_is_safe("segment_00001.ts"));
        assert!(!path_component_is_safe("../etc"));
        assert!(!path_component_is_safe("a/b"));
        assert!(!path_component_is_safe(""));
    }
}
