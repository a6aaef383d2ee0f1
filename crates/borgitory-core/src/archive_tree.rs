//! Archive Tree (component G): a lazy virtual directory index over a Borg
//! archive listing, with intermediate-directory synthesis and a per-archive
//! cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::commands::{self, BuiltCommand};
use crate::error::{ParseError, SpawnError};
use crate::executor::{self, StreamTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

/// A Borg listing record for an explicit node, kept verbatim so the
/// rendering layer decides which fields to expose.
#[derive(Debug, Clone)]
pub struct ListingRecord {
    pub size: Option<u64>,
    pub mtime: Option<String>,
    pub mode: Option<String>,
}

/// An interior node of the lazy archive index.
#[derive(Debug, Clone)]
pub struct ArchiveTreeNode {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    pub explicit: bool,
    pub record: Option<ListingRecord>,
    pub children: HashMap<String, ArchiveTreeNode>,
}

impl ArchiveTreeNode {
    fn new_dir(path: String, name: String, explicit: bool) -> Self {
        Self {
            path,
            name,
            kind: NodeKind::Dir,
            explicit,
            record: None,
            children: HashMap::new(),
        }
    }
}

/// A directory-listing entry as handed back to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    pub size: Option<u64>,
    pub modified: Option<String>,
    pub mode: Option<String>,
    pub is_virtual: bool,
}

/// A per-archive lazy directory index, keyed by `(repository_path,
/// archive_name)` by the owning [`ArchiveExplorer`].
#[derive(Default)]
pub struct VirtualArchiveTree {
    root: ArchiveTreeNode,
    loaded_paths: std::collections::HashSet<String>,
    root_loaded: bool,
}

impl VirtualArchiveTree {
    pub fn new() -> Self {
        Self {
            root: ArchiveTreeNode::new_dir(String::new(), String::new(), true),
            loaded_paths: std::collections::HashSet::new(),
            root_loaded: false,
        }
    }

    fn get_or_create_node<'a>(
        node: &'a mut ArchiveTreeNode,
        path_so_far: &mut String,
        component: &str,
        is_leaf: bool,
        leaf_kind: NodeKind,
    ) -> &'a mut ArchiveTreeNode {
        if !path_so_far.is_empty() {
            path_so_far.push('/');
        }
        path_so_far.push_str(component);

        node.children.entry(component.to_string()).or_insert_with(|| {
            let kind = if is_leaf { leaf_kind } else { NodeKind::Dir };
            ArchiveTreeNode {
                path: path_so_far.clone(),
                name: component.to_string(),
                kind,
                explicit: false,
                record: None,
                children: HashMap::new(),
            }
        })
    }

    /// Ingests a real borg record at `full_path`, synthesizing any missing
    /// intermediate directory nodes. If a previously-synthesised directory
    /// node now has an explicit record, it flips to explicit while
    /// retaining its accumulated children.
    pub fn add_entry(&mut self, full_path: &str, kind: NodeKind, record: ListingRecord) {
        let components: Vec<&str> = full_path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return;
        }

        let mut current = &mut self.root;
        let mut path_so_far = String::new();
        let last = components.len() - 1;

        for (i, component) in components.iter().enumerate() {
            let is_leaf = i == last;
            current = Self::get_or_create_node(current, &mut path_so_far, component, is_leaf, kind);
            if is_leaf {
                current.kind = kind;
                current.explicit = true;
                current.record = Some(record.clone());
            }
        }
    }

    fn find_node(&self, path: &str) -> Option<&ArchiveTreeNode> {
        if path.is_empty() {
            return Some(&self.root);
        }
        let mut node = &self.root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            node = node.children.get(component)?;
        }
        Some(node)
    }

    /// Returns children of the node at `path`, directories first then
    /// files, each alphabetical case-insensitive.
    pub fn get_directory_contents(&self, path: &str) -> Option<Vec<DirectoryEntry>> {
        let node = self.find_node(path)?;
        let mut entries: Vec<DirectoryEntry> = node
            .children
            .values()
            .map(|child| DirectoryEntry {
                name: child.name.clone(),
                path: child.path.clone(),
                kind: child.kind,
                size: child.record.as_ref().and_then(|r| r.size),
                modified: child.record.as_ref().and_then(|r| r.mtime.clone()),
                mode: child
                    .record
                    .as_ref()
                    .and_then(|r| r.mode.clone())
                    .or_else(|| (child.kind == NodeKind::Dir).then(|| "drwxr-xr-x".to_string())),
                is_virtual: !child.explicit,
            })
            .collect();

        entries.sort_by(|a, b| {
            let a_is_dir = a.kind == NodeKind::Dir;
            let b_is_dir = b.kind == NodeKind::Dir;
            match (a_is_dir, b_is_dir) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            }
        });
        Some(entries)
    }

    pub fn path_needs_loading(&self, path: &str) -> bool {
        !self.root_loaded && !self.loaded_paths.contains(path)
    }

    pub fn mark_path_loaded(&mut self, path: &str) {
        self.loaded_paths.insert(path.to_string());
    }

    pub fn mark_root_loaded(&mut self) {
        self.root_loaded = true;
    }
}

/// Parses `borg list --json-lines` output, one record per line.
pub fn parse_listing_lines(output: &str) -> Result<Vec<(String, NodeKind, ListingRecord)>, ParseError> {
    let mut out = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)?;
        let path = value
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let type_field = value.get("type").and_then(|v| v.as_str()).unwrap_or("-");
        let kind = if type_field == "d" { NodeKind::Dir } else { NodeKind::File };
        let record = ListingRecord {
            size: value.get("size").and_then(|v| v.as_u64()),
            mtime: value.get("mtime").and_then(|v| v.as_str()).map(str::to_string),
            mode: value.get("mode").and_then(|v| v.as_str()).map(str::to_string),
        };
        out.push((path, kind, record));
    }
    Ok(out)
}

/// Failure fetching a listing from the external `borg` binary. Per §4.G, a
/// Borg failure always propagates; the tree never ends up partially
/// populated and silently served.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveListError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("borg list exited with status {0}")]
    NonZeroExit(i32),

    #[error("borg list timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

async fn run_listing(cmd: &BuiltCommand, timeout: Duration) -> Result<String, ArchiveListError> {
    let handle = executor::start(&cmd.argv, &cmd.env, None)?;

    let mut stdout = String::new();
    let monitored = executor::monitor(
        handle,
        |line| {
            if line.tag == StreamTag::Stdout {
                stdout.push_str(&line.text);
                stdout.push('\n');
            }
        },
        |_| {},
    );

    let result = tokio::time::timeout(timeout, monitored)
        .await
        .map_err(|_| ArchiveListError::TimedOut(timeout))?;

    if result.return_code != 0 {
        return Err(ArchiveListError::NonZeroExit(result.return_code));
    }
    Ok(stdout)
}

/// Caches a [`VirtualArchiveTree`] per `(repo_path, archive_name)` and
/// coordinates root-vs-targeted loads. Construction of the underlying tree
/// for a given key is itself serialised by a per-key mutex so concurrent
/// readers never duplicate a load.
pub struct ArchiveExplorer {
    cache: Mutex<HashMap<String, Arc<Mutex<VirtualArchiveTree>>>>,
}

impl ArchiveExplorer {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(repo_path: &str, archive_name: &str) -> String {
        format!("{repo_path}::{archive_name}")
    }

    async fn tree_for(&self, repo_path: &str, archive_name: &str) -> Arc<Mutex<VirtualArchiveTree>> {
        let key = Self::cache_key(repo_path, archive_name);
        let mut cache = self.cache.lock().await;
        cache
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(VirtualArchiveTree::new())))
            .clone()
    }

    pub async fn clear_cache(&self, repo_path: &str, archive_name: &str) {
        let key = Self::cache_key(repo_path, archive_name);
        self.cache.lock().await.remove(&key);
    }

    /// Ingests already-fetched listing lines for a root load.
    pub async fn ingest_root_listing(&self, repo_path: &str, archive_name: &str, output: &str) -> Result<(), ParseError> {
        let entries = parse_listing_lines(output)?;
        let tree = self.tree_for(repo_path, archive_name).await;
        let mut tree = tree.lock().await;
        for (path, kind, record) in entries {
            tree.add_entry(&path, kind, record);
        }
        tree.mark_root_loaded();
        Ok(())
    }

    /// Ingests already-fetched listing lines for a targeted directory load.
    pub async fn ingest_targeted_listing(
        &self,
        repo_path: &str,
        archive_name: &str,
        dir_path: &str,
        output: &str,
    ) -> Result<(), ParseError> {
        let entries = parse_listing_lines(output)?;
        let tree = self.tree_for(repo_path, archive_name).await;
        let mut tree = tree.lock().await;
        for (path, kind, record) in entries {
            tree.add_entry(&path, kind, record);
        }
        tree.mark_path_loaded(dir_path);
        Ok(())
    }

    pub async fn needs_loading(&self, repo_path: &str, archive_name: &str, path: &str) -> bool {
        let tree = self.tree_for(repo_path, archive_name).await;
        let tree = tree.lock().await;
        tree.path_needs_loading(path)
    }

    /// Fetches and ingests whatever listing `path` requires: a root load on
    /// first access to the archive, or a targeted pattern-filtered load
    /// when the root hasn't been loaded yet and a specific subdirectory is
    /// requested. A no-op if `path` is already covered by a prior load.
    pub async fn ensure_loaded(
        &self,
        repo_path: &str,
        passphrase: &str,
        archive_name: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<(), ArchiveListError> {
        if !self.needs_loading(repo_path, archive_name, path).await {
            return Ok(());
        }

        if path.is_empty() {
            let cmd = commands::borg_list_archive_contents(repo_path, passphrase, archive_name, None);
            let output = run_listing(&cmd, timeout).await?;
            self.ingest_root_listing(repo_path, archive_name, &output).await?;
        } else {
            let cmd =
                commands::borg_list_archive_contents(repo_path, passphrase, archive_name, Some(path));
            let output = run_listing(&cmd, timeout).await?;
            self.ingest_targeted_listing(repo_path, archive_name, path, &output)
                .await?;
        }
        Ok(())
    }

    pub async fn get_directory_contents(
        &self,
        repo_path: &str,
        archive_name: &str,
        path: &str,
    ) -> Option<Vec<DirectoryEntry>> {
        let tree = self.tree_for(repo_path, archive_name).await;
        let tree = tree.lock().await;
        tree.get_directory_contents(path)
    }
}

impl Default for ArchiveExplorer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_record() -> ListingRecord {
        ListingRecord {
            size: Some(10),
            mtime: Some("2026-01-01T00:00:00".to_string()),
            mode: Some("-rw-r--r--".to_string()),
        }
    }

    #[test]
    fn synthesises_intermediate_directories() {
        let mut tree = VirtualArchiveTree::new();
        tree.add_entry("home/user/a.txt", NodeKind::File, file_record());
        tree.add_entry("home/user/b.txt", NodeKind::File, file_record());
        tree.add_entry("var/log/x.log", NodeKind::File, file_record());

        let root = tree.get_directory_contents("").unwrap();
        let names: Vec<_> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["home", "var"]);
        assert!(root.iter().all(|e| e.is_virtual));

        let user = tree.get_directory_contents("home/user").unwrap();
        let names: Vec<_> = user.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(user.iter().all(|e| !e.is_virtual));
    }

    #[test]
    fn explicit_record_flips_virtual_dir_and_keeps_children() {
        let mut tree = VirtualArchiveTree::new();
        tree.add_entry("home/user/a.txt", NodeKind::File, file_record());
        assert!(!tree.find_node("home").unwrap().explicit);

        tree.add_entry(
            "home",
            NodeKind::Dir,
            ListingRecord {
                size: None,
                mtime: Some("2026-01-01T00:00:00".to_string()),
                mode: Some("drwxr-xr-x".to_string()),
            },
        );

        let home = tree.find_node("home").unwrap();
        assert!(home.explicit);
        assert_eq!(home.children.len(), 1);
    }

    #[test]
    fn directories_sort_before_files_case_insensitive() {
        let mut tree = VirtualArchiveTree::new();
        tree.add_entry("b.txt", NodeKind::File, file_record());
        tree.add_entry("A", NodeKind::Dir, file_record());
        tree.add_entry("a.txt", NodeKind::File, file_record());

        let root = tree.get_directory_contents("").unwrap();
        let names: Vec<_> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn run_listing_captures_stdout_on_success() {
        let cmd = BuiltCommand {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"echo '{"path":"a.txt","type":"-","size":1}'"#.to_string(),
            ],
            env: HashMap::new(),
        };
        let output = run_listing(&cmd, Duration::from_secs(5)).await.unwrap();
        assert!(output.contains("a.txt"));
    }

    #[tokio::test]
    async fn run_listing_propagates_nonzero_exit() {
        let cmd = BuiltCommand {
            argv: vec!["sh".to_string(), "-c".to_string(), "exit 2".to_string()],
            env: HashMap::new(),
        };
        let err = run_listing(&cmd, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ArchiveListError::NonZeroExit(2)));
    }

    #[tokio::test]
    async fn run_listing_times_out_on_a_hanging_command() {
        let cmd = BuiltCommand {
            argv: vec!["sleep".to_string(), "30".to_string()],
            env: HashMap::new(),
        };
        let err = run_listing(&cmd, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ArchiveListError::TimedOut(_)));
    }

    #[tokio::test]
    async fn ensure_loaded_propagates_borg_spawn_failure() {
        let explorer = ArchiveExplorer::new();
        let err = explorer
            .ensure_loaded(
                "/repo",
                "secret",
                "archive1",
                "",
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveListError::Spawn(_)));
    }

    #[tokio::test]
    async fn ensure_loaded_is_a_noop_once_root_is_loaded() {
        let explorer = ArchiveExplorer::new();
        explorer
            .ingest_root_listing("/repo", "archive1", "")
            .await
            .unwrap();

        // With the root already loaded, ensure_loaded must not attempt to
        // spawn `borg` at all (which would error, since it isn't on PATH).
        explorer
            .ensure_loaded("/repo", "secret", "archive1", "home", Duration::from_secs(5))
            .await
            .unwrap();
    }
}
