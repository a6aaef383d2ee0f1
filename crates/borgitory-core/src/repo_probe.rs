//! Repository Probe (component H): scans a base directory for Borg
//! repositories, classifies their encryption mode, and verifies access by
//! dry-run listing.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::{ParseError, VerifyError};
use crate::executor::{self, StreamTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    Repokey,
    Keyfile,
    None,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DetectedRepository {
    pub path: String,
    pub id: String,
    pub encryption_mode: EncryptionMode,
    pub requires_keyfile: bool,
    pub preview_text: String,
}

fn parse_repository_section(config_text: &str) -> Option<HashMap<String, String>> {
    let mut in_section = false;
    let mut fields = HashMap::new();
    for line in config_text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            in_section = trimmed == "[repository]";
            continue;
        }
        if !in_section || trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

fn classify_encryption(fields: &HashMap<String, String>, repo_dir: &Path) -> (EncryptionMode, bool) {
    match fields.get("key") {
        Some(key) if key.len() > 50 => (EncryptionMode::Repokey, false),
        _ => {
            let has_sibling_keyfile = fs::read_dir(repo_dir)
                .map(|entries| {
                    let key_pattern = Regex::new(r"^key\..+").expect("valid regex");
                    entries.flatten().any(|entry| {
                        entry
                            .file_name()
                            .to_str()
                            .map(|name| key_pattern.is_match(name))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);

            if has_sibling_keyfile {
                (EncryptionMode::Keyfile, true)
            } else if fields.contains_key("key") {
                // empty `key =` line with no sibling keyfile: conservative
                // default per the ambiguous-config rule below.
                (EncryptionMode::Unknown, false)
            } else {
                (EncryptionMode::None, false)
            }
        }
    }
}

/// Scans `base_dir` for Borg repositories: any immediate subdirectory whose
/// `config` file contains a `[repository]` section.
pub fn scan(base_dir: &Path) -> Vec<DetectedRepository> {
    let Ok(entries) = fs::read_dir(base_dir) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let repo_dir = entry.path();
        if !repo_dir.is_dir() {
            continue;
        }
        let config_path = repo_dir.join("config");
        let Ok(config_text) = fs::read_to_string(&config_path) else {
            continue;
        };
        let Some(fields) = parse_repository_section(&config_text) else {
            continue;
        };
        let Some(id) = fields.get("id").cloned() else {
            continue;
        };

        let (mut mode, requires_keyfile) = classify_encryption(&fields, &repo_dir);
        // Conservative default: treat an ambiguous but validly-parsed
        // config as `repokey` rather than leaving it `unknown`.
        if mode == EncryptionMode::Unknown {
            mode = EncryptionMode::Repokey;
        }

        found.push(DetectedRepository {
            path: repo_dir.display().to_string(),
            id,
            encryption_mode: mode,
            requires_keyfile,
            preview_text: config_text,
        });
    }
    found
}

/// Verifies access to a repository by running a JSON listing command with
/// the supplied passphrase. Exit code 0 AND parseable JSON output means
/// access is verified; anything else means it is not.
pub async fn verify_access(repo_path: &str, passphrase: &str) -> Result<(), VerifyError> {
    let cmd = crate::commands::borg_list_archives(repo_path, passphrase);
    let handle = executor::start(&cmd.argv, &cmd.env, None)?;

    let mut stdout = String::new();
    let result = executor::monitor(
        handle,
        |line| {
            if line.tag == StreamTag::Stdout {
                stdout.push_str(&line.text);
                stdout.push('\n');
            }
        },
        |_| {},
    )
    .await;

    if result.return_code != 0 {
        return Err(VerifyError::NonZeroExit(result.return_code));
    }

    extract_json_object(&stdout).map_err(VerifyError::Parse)?;
    Ok(())
}

/// Parses the substring between the first `{` and last `}` as JSON.
pub fn extract_json_object(text: &str) -> Result<serde_json::Value, ParseError> {
    let start = text.find('{').ok_or(ParseError::NoJsonObject)?;
    let end = text.rfind('}').ok_or(ParseError::NoJsonObject)?;
    if end < start {
        return Err(ParseError::NoJsonObject);
    }
    Ok(serde_json::from_str(&text[start..=end])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn classifies_repokey_from_long_key_field() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "abcd1234".to_string());
        fields.insert("key".to_string(), "x".repeat(80));
        let dir = tempfile::tempdir().unwrap();
        let (mode, requires_keyfile) = classify_encryption(&fields, dir.path());
        assert_eq!(mode, EncryptionMode::Repokey);
        assert!(!requires_keyfile);
    }

    #[test]
    fn classifies_keyfile_from_sibling_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fs::File::create(dir.path().join("key.abc123")).unwrap();
        writeln!(f, "keyfile contents").unwrap();

        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "abcd1234".to_string());
        fields.insert("key".to_string(), String::new());
        let (mode, requires_keyfile) = classify_encryption(&fields, dir.path());
        assert_eq!(mode, EncryptionMode::Keyfile);
        assert!(requires_keyfile);
    }

    #[test]
    fn scan_finds_repository_config() {
        let base = tempfile::tempdir().unwrap();
        let repo_dir = base.path().join("repo1");
        fs::create_dir(&repo_dir).unwrap();
        fs::write(
            repo_dir.join("config"),
            format!("[repository]\nid = abcd1234\nkey = {}\n", "y".repeat(80)),
        )
        .unwrap();

        let found = scan(base.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "abcd1234");
        assert_eq!(found[0].encryption_mode, EncryptionMode::Repokey);
    }

    #[test]
    fn extract_json_object_finds_braces() {
        let text = "some preamble {\"archives\": []} trailing";
        let value = extract_json_object(text).unwrap();
        assert!(value.get("archives").is_some());
    }
}
