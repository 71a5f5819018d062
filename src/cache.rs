//! Transcript cache keying and storage.
//!
//! The cache key is `slug(instruction)[..50] + "_" + sha256(instruction +
//! ":::" + json(schema))` — the slug prefix is informational, the hash is
//! the identity. Files live under `<project root>/.klendathu/cache` unless
//! `KLENDATHU_CACHE` overrides the directory. All writes are best-effort:
//! a cache failure must never fail the request.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::trace;
use crate::transcript::Transcript;

/// Lowercase the instruction and collapse runs of non-alphanumerics into
/// single underscores, trimming leading/trailing ones.
pub fn slug(instruction: &str) -> String {
    let mut out = String::new();
    let mut pending_sep = false;
    for ch in instruction.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Form the cache key for `(instruction, schema)`.
///
/// `schema_json` must be the schema's canonical JSON rendering
/// ([`crate::schema::Schema::canonical_json`]); cosmetic whitespace never
/// reaches the hash.
pub fn cache_key(instruction: &str, schema_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instruction.as_bytes());
    hasher.update(b":::");
    hasher.update(schema_json.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    let prefix: String = slug(instruction).chars().take(50).collect();
    format!("{}_{}", prefix, hex)
}

/// File path for a cache key inside a cache directory.
pub fn cache_path(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir.join(format!("{}.json", key))
}

/// Find the project root: the nearest ancestor containing a `.klendathu`
/// entry, else the nearest ancestor containing `.git`, else `start` itself.
pub fn find_project_root(start: &Path) -> PathBuf {
    for dir in start.ancestors() {
        if dir.join(".klendathu").exists() {
            return dir.to_path_buf();
        }
    }
    for dir in start.ancestors() {
        if dir.join(".git").exists() {
            return dir.to_path_buf();
        }
    }
    start.to_path_buf()
}

/// Default cache directory: `<project root>/.klendathu/cache`, where the
/// project root is derived from the current working directory.
pub fn default_cache_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_project_root(&cwd).join(".klendathu").join("cache")
}

/// Load a cached transcript. Returns `None` when the file is absent or
/// unreadable, and for transcripts whose `success` flag is not `true` —
/// failed runs are never replayed.
pub async fn load_transcript(path: &Path) -> Option<Transcript> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::debug!("failed to read cache file {}: {}", path.display(), err);
            return None;
        }
    };
    let transcript: Transcript = match serde_json::from_slice(&bytes) {
        Ok(t) => t,
        Err(err) => {
            tracing::warn!("failed to parse cache file {}: {}", path.display(), err);
            return None;
        }
    };
    if !transcript.success {
        trace::trace_log(&format!(
            "cache: ignoring unsuccessful transcript at {}",
            path.display()
        ));
        return None;
    }
    Some(transcript)
}

/// Write a transcript, creating the cache directory as needed. Best-effort:
/// failures are traced and swallowed.
pub async fn store_transcript(path: &Path, transcript: &Transcript) {
    if let Err(err) = try_store(path, transcript).await {
        trace::trace_log(&format!(
            "cache: failed to write {}: {}",
            path.display(),
            err
        ));
        tracing::debug!("failed to write cache file {}: {}", path.display(), err);
    }
}

async fn try_store(path: &Path, transcript: &Transcript) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(transcript)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, data).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::TaskRecord;

    #[test]
    fn slug_collapses_and_lowercases() {
        assert_eq!(
            slug("Double each number in the input array."),
            "double_each_number_in_the_input_array"
        );
        assert_eq!(slug("  --Weird--  input!! "), "weird_input");
        assert_eq!(slug("!!!"), "");
    }

    #[test]
    fn cache_key_has_slug_prefix_and_hex_hash() {
        let key = cache_key("Double the numbers", "{}");
        let (prefix, hash) = key.rsplit_once('_').unwrap();
        assert_eq!(prefix, "double_the_numbers");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_key_prefix_is_truncated_to_fifty_chars() {
        let long = "a very long instruction that keeps going and going and going forever";
        let key = cache_key(long, "{}");
        let (prefix, _) = key.rsplit_once('_').unwrap();
        assert!(prefix.len() <= 50);
    }

    #[test]
    fn cache_key_depends_on_schema() {
        let a = cache_key("same instruction", r#"{"n":{"type":"number"}}"#);
        let b = cache_key("same instruction", r#"{"n":{"type":"string"}}"#);
        assert_ne!(a, b);
    }

    #[test]
    fn project_root_prefers_klendathu_marker_over_git() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("nested/.klendathu")).unwrap();
        std::fs::create_dir_all(root.join("nested/deep")).unwrap();

        let found = find_project_root(&root.join("nested/deep"));
        assert_eq!(found, root.join("nested"));
    }

    #[test]
    fn project_root_falls_back_to_git_then_start() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("repo/.git")).unwrap();
        std::fs::create_dir_all(root.join("repo/src")).unwrap();
        assert_eq!(find_project_root(&root.join("repo/src")), root.join("repo"));

        std::fs::create_dir_all(root.join("plain")).unwrap();
        assert_eq!(find_project_root(&root.join("plain")), root.join("plain"));
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_path(dir.path(), "some_key");

        let mut transcript = Transcript::new(TaskRecord::new("p", None, vec![]));
        transcript.success = true;
        store_transcript(&path, &transcript).await;

        let loaded = load_transcript(&path).await.unwrap();
        assert!(loaded.success);
        assert_eq!(loaded.task.prompt, "p");
    }

    #[tokio::test]
    async fn load_ignores_unsuccessful_transcripts() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_path(dir.path(), "failed_key");

        let transcript = Transcript::new(TaskRecord::new("p", None, vec![]));
        store_transcript(&path, &transcript).await;

        assert!(load_transcript(&path).await.is_none());
    }

    #[tokio::test]
    async fn load_returns_none_for_missing_or_garbage_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_transcript(&dir.path().join("absent.json")).await.is_none());

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, b"not json").unwrap();
        assert!(load_transcript(&garbage).await.is_none());
    }

    #[tokio::test]
    async fn store_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c/key.json");
        let mut transcript = Transcript::new(TaskRecord::new("p", None, vec![]));
        transcript.success = true;
        store_transcript(&path, &transcript).await;
        assert!(path.exists());
    }
}
