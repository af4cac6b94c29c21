//! Immutable folder/file tree rebuilt from a flat key listing
//!
//! Nodes live in one arena indexed by `NodeId`; the root folder is always
//! `NodeId::ROOT`. A tree is never patched: every refresh builds a new one.

use crate::error::{EngineError, EngineResult};
use crate::providers::ObjectEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileNode {
    pub id: NodeId,
    pub parent: NodeId,
    pub name: String,
    /// Slash-joined names from the root.
    pub path: String,
    /// Object key used for transfers. Equal to `path` unless the key had
    /// empty segments.
    pub key: String,
    pub size: u64,
    pub last_modified: i64,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub name: String,
    /// Slash-joined names from the root; empty for the root.
    pub path: String,
    /// Folders first, then files, each group sorted by name.
    pub children: Vec<NodeId>,
    /// Files directly inside this folder.
    pub file_count: usize,
    /// Files anywhere below this folder.
    pub total_file_count: usize,
    pub total_size: u64,
    /// Newest modification time of any file below, 0 when empty.
    pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    File(FileNode),
    Folder(FolderNode),
}

impl Node {
    pub fn id(&self) -> NodeId {
        match self {
            Node::File(f) => f.id,
            Node::Folder(f) => f.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::File(f) => &f.name,
            Node::Folder(f) => &f.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Node::File(f) => &f.path,
            Node::Folder(f) => &f.path,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Node::Folder(_))
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(f) => Some(f),
            Node::Folder(_) => None,
        }
    }

    pub fn as_folder(&self) -> Option<&FolderNode> {
        match self {
            Node::Folder(f) => Some(f),
            Node::File(_) => None,
        }
    }
}

#[derive(Default)]
struct DraftFolder {
    folders: BTreeMap<String, DraftFolder>,
    files: BTreeMap<String, ObjectEntry>,
}

impl DraftFolder {
    fn insert(&mut self, entry: &ObjectEntry) {
        let is_marker = entry.key.ends_with('/');
        let segments: Vec<&str> = entry.key.split('/').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };

        let mut folder = self;
        for segment in parents {
            folder = folder.folders.entry(segment.to_string()).or_default();
        }
        if is_marker {
            folder.folders.entry(last.to_string()).or_default();
        } else {
            // Duplicate keys: the later listing entry wins.
            folder.files.insert(last.to_string(), entry.clone());
        }
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VirtualTree {
    nodes: Vec<Node>,
}

impl Default for VirtualTree {
    fn default() -> Self {
        Self::build_from(&[])
    }
}

impl VirtualTree {
    /// Build the tree for a bucket listing.
    ///
    /// Keys are split on `/`, empty segments are ignored and a key ending in
    /// `/` only creates folders. When a name is both a file and a folder in
    /// the same parent the folder is kept and the file dropped.
    pub fn build_from(entries: &[ObjectEntry]) -> Self {
        let mut draft = DraftFolder::default();
        for entry in entries {
            draft.insert(entry);
        }

        let mut tree = VirtualTree {
            nodes: Vec::with_capacity(entries.len() + 1),
        };
        tree.emit_folder(draft, String::new(), String::new(), None);
        log::debug!(
            "vdir: built tree with {} nodes from {} keys",
            tree.nodes.len(),
            entries.len()
        );
        tree
    }

    /// Depth-first, so ids follow listing order.
    fn emit_folder(
        &mut self,
        draft: DraftFolder,
        name: String,
        path: String,
        parent: Option<NodeId>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::Folder(FolderNode {
            id,
            parent,
            name,
            path: path.clone(),
            children: Vec::new(),
            file_count: 0,
            total_file_count: 0,
            total_size: 0,
            last_modified: 0,
        }));

        let DraftFolder { folders, mut files } = draft;
        files.retain(|file_name, entry| {
            let collides = folders.contains_key(file_name);
            if collides {
                log::warn!(
                    "vdir: dropping object '{}', a folder of the same name exists",
                    entry.key
                );
            }
            !collides
        });

        let mut children = Vec::with_capacity(folders.len() + files.len());
        let mut total_file_count = 0;
        let mut total_size = 0;
        let mut last_modified = 0;

        for (child_name, child) in folders {
            let child_path = join(&path, &child_name);
            let child_id = self.emit_folder(child, child_name, child_path, Some(id));
            if let Some(Node::Folder(folder)) = self.nodes.get(child_id.0) {
                total_file_count += folder.total_file_count;
                total_size += folder.total_size;
                last_modified = last_modified.max(folder.last_modified);
            }
            children.push(child_id);
        }

        let file_count = files.len();
        for (file_name, entry) in files {
            let file_id = NodeId(self.nodes.len());
            total_size += entry.size;
            last_modified = last_modified.max(entry.last_modified);
            self.nodes.push(Node::File(FileNode {
                id: file_id,
                parent: id,
                path: join(&path, &file_name),
                name: file_name,
                key: entry.key,
                size: entry.size,
                last_modified: entry.last_modified,
                meta: entry.meta,
            }));
            children.push(file_id);
        }
        total_file_count += file_count;

        if let Some(Node::Folder(folder)) = self.nodes.get_mut(id.0) {
            folder.children = children;
            folder.file_count = file_count;
            folder.total_file_count = total_file_count;
            folder.total_size = total_size;
            folder.last_modified = last_modified;
        }
        id
    }

    pub fn root(&self) -> &FolderNode {
        match self.nodes.first() {
            Some(Node::Folder(root)) => root,
            _ => unreachable!("tree always starts with the root folder"),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn get_item(&self, id: NodeId) -> EngineResult<&Node> {
        self.get(id)
            .ok_or_else(|| EngineError::not_found(format!("item {}", id)))
    }

    pub fn folder(&self, id: NodeId) -> Option<&FolderNode> {
        self.get(id).and_then(Node::as_folder)
    }

    /// Children of a folder in listing order; empty for files and unknown ids.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &Node> + '_ {
        self.folder(id)
            .map(|f| f.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(move |child| self.get(*child))
    }

    pub fn child_by_name(&self, folder: NodeId, name: &str) -> Option<&Node> {
        self.children(folder).find(|node| node.name() == name)
    }

    /// Look a node up by its slash-joined path. `""` is the root.
    pub fn find_path(&self, path: &str) -> Option<&Node> {
        let mut current = self.get(NodeId::ROOT)?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = self.child_by_name(current.id(), segment)?;
        }
        Some(current)
    }

    /// Every node path below the root, folders with a trailing `/`.
    pub fn paths(&self) -> Vec<String> {
        self.nodes
            .iter()
            .skip(1)
            .map(|node| match node {
                Node::Folder(f) => format!("{}/", f.path),
                Node::File(f) => f.path.clone(),
            })
            .collect()
    }

    /// Node count including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn file_count(&self) -> usize {
        self.root().total_file_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(keys: &[&str]) -> Vec<ObjectEntry> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| ObjectEntry::new(*key, 10 * (i as u64 + 1), 1_700_000_000 + i as i64))
            .collect()
    }

    fn child_names(tree: &VirtualTree, id: NodeId) -> Vec<(String, bool)> {
        tree.children(id)
            .map(|n| (n.name().to_string(), n.is_folder()))
            .collect()
    }

    #[test]
    fn builds_nested_folders_from_keys() {
        let tree = VirtualTree::build_from(&entries(&["a/b.txt", "a/c/d.txt", "e.txt"]));

        assert_eq!(
            child_names(&tree, NodeId::ROOT),
            vec![("a".to_string(), true), ("e.txt".to_string(), false)]
        );
        let a = tree.find_path("a").unwrap().id();
        assert_eq!(
            child_names(&tree, a),
            vec![("c".to_string(), true), ("b.txt".to_string(), false)]
        );
        let c = tree.find_path("a/c").unwrap().id();
        assert_eq!(child_names(&tree, c), vec![("d.txt".to_string(), false)]);

        let d = tree.find_path("a/c/d.txt").unwrap().as_file().unwrap();
        assert_eq!(d.key, "a/c/d.txt");
        assert_eq!(d.parent, c);
    }

    #[test]
    fn repeated_prefixes_share_one_folder() {
        let tree = VirtualTree::build_from(&entries(&["x/1", "x/2", "x/y/3", "x/y/4"]));
        assert_eq!(child_names(&tree, NodeId::ROOT).len(), 1);
        assert_eq!(tree.paths(), vec!["x/", "x/y/", "x/y/3", "x/y/4", "x/1", "x/2"]);
    }

    #[test]
    fn build_is_idempotent_and_order_independent() {
        let keys = ["photos/2024/a.jpg", "notes.md", "photos/b.jpg", "photos/2023/"];
        let first = VirtualTree::build_from(&entries(&keys));
        let second = VirtualTree::build_from(&entries(&keys));
        assert_eq!(first.paths(), second.paths());

        let mut reversed = entries(&keys);
        reversed.reverse();
        assert_eq!(VirtualTree::build_from(&reversed).paths(), first.paths());
    }

    #[test]
    fn aggregates_roll_up_to_ancestors() {
        let list = vec![
            ObjectEntry::new("a/b.txt", 5, 100),
            ObjectEntry::new("a/c/d.txt", 7, 300),
            ObjectEntry::new("e.txt", 11, 200),
        ];
        let tree = VirtualTree::build_from(&list);

        let root = tree.root();
        assert_eq!(root.file_count, 1);
        assert_eq!(root.total_file_count, 3);
        assert_eq!(root.total_size, 23);
        assert_eq!(root.last_modified, 300);

        let a = tree.find_path("a").unwrap().as_folder().unwrap();
        assert_eq!(a.file_count, 1);
        assert_eq!(a.total_file_count, 2);
        assert_eq!(a.total_size, 12);
        assert_eq!(tree.file_count(), 3);
    }

    #[test]
    fn folder_wins_name_collision() {
        let tree = VirtualTree::build_from(&entries(&["docs", "docs/readme.md"]));
        assert!(tree.find_path("docs").unwrap().is_folder());
        assert_eq!(tree.file_count(), 1);

        let reversed = VirtualTree::build_from(&entries(&["docs/readme.md", "docs"]));
        assert_eq!(reversed.paths(), tree.paths());
    }

    #[test]
    fn markers_and_empty_segments() {
        let tree = VirtualTree::build_from(&entries(&["empty/", "a//b.txt", "/", ""]));
        assert_eq!(tree.paths(), vec!["a/", "a/b.txt", "empty/"]);

        let empty = tree.find_path("empty").unwrap().as_folder().unwrap();
        assert!(empty.children.is_empty());
        assert_eq!(empty.total_file_count, 0);

        let b = tree.find_path("a/b.txt").unwrap().as_file().unwrap();
        assert_eq!(b.key, "a//b.txt");
        assert_eq!(b.path, "a/b.txt");
    }

    #[test]
    fn duplicate_keys_keep_last_entry() {
        let list = vec![ObjectEntry::new("k.txt", 1, 1), ObjectEntry::new("k.txt", 2, 2)];
        let tree = VirtualTree::build_from(&list);
        assert_eq!(tree.find_path("k.txt").unwrap().as_file().unwrap().size, 2);
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn lookups_by_id() {
        let tree = VirtualTree::build_from(&entries(&["a/b.txt"]));
        let b = tree.find_path("a/b.txt").unwrap().id();
        assert_eq!(tree.get_item(b).unwrap().name(), "b.txt");
        assert!(matches!(
            tree.get_item(NodeId(99)),
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(tree.children(b).count(), 0);
        assert!(VirtualTree::default().is_empty());
    }
}
