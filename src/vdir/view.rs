//! Cursor, breadcrumbs, search filter and selection over one tree

use super::tree::{FileNode, FolderNode, Node, NodeId, VirtualTree};
use super::walk::FileWalker;
use crate::error::{EngineError, EngineResult};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Navigation state for the displayed bucket. All of it is reset whenever a
/// new tree is swapped in.
#[derive(Debug, Clone)]
pub struct DirectoryView {
    tree: Arc<VirtualTree>,
    cursor: NodeId,
    breadcrumbs: Vec<NodeId>,
    search: Option<String>,
    selection: BTreeSet<NodeId>,
}

impl Default for DirectoryView {
    fn default() -> Self {
        Self::new(Arc::new(VirtualTree::default()))
    }
}

impl DirectoryView {
    pub fn new(tree: Arc<VirtualTree>) -> Self {
        Self {
            tree,
            cursor: NodeId::ROOT,
            breadcrumbs: Vec::new(),
            search: None,
            selection: BTreeSet::new(),
        }
    }

    pub fn tree(&self) -> &Arc<VirtualTree> {
        &self.tree
    }

    /// Swap in a freshly built tree and return to its root.
    pub fn replace_tree(&mut self, tree: Arc<VirtualTree>) {
        self.tree = tree;
        self.cursor = NodeId::ROOT;
        self.breadcrumbs.clear();
        self.search = None;
        self.selection.clear();
    }

    pub fn cursor(&self) -> NodeId {
        self.cursor
    }

    pub fn breadcrumbs(&self) -> &[NodeId] {
        &self.breadcrumbs
    }

    pub fn current_folder(&self) -> &FolderNode {
        self.tree
            .folder(self.cursor)
            .unwrap_or_else(|| self.tree.root())
    }

    /// Children of the current folder, folders first.
    pub fn list_files(&self) -> Vec<&Node> {
        self.tree.children(self.cursor).collect()
    }

    /// Descend into the child folder `name`.
    pub fn change_dir(&mut self, name: &str) -> EngineResult<()> {
        let target = match self.tree.child_by_name(self.cursor, name) {
            Some(Node::Folder(folder)) => folder.id,
            _ => {
                return Err(EngineError::not_found(format!(
                    "folder '{}' in '{}'",
                    name,
                    self.path_prefix()
                )))
            }
        };
        self.breadcrumbs.push(self.cursor);
        self.cursor = target;
        self.search = None;
        self.selection.clear();
        Ok(())
    }

    /// Return to the previous folder. Returns false at the root.
    pub fn back(&mut self) -> bool {
        match self.breadcrumbs.pop() {
            Some(previous) => {
                self.cursor = previous;
                self.search = None;
                self.selection.clear();
                true
            }
            None => false,
        }
    }

    pub fn get_item(&self, id: NodeId) -> EngineResult<&Node> {
        self.tree.get_item(id)
    }

    /// Entries shown for the current folder, after the search filter.
    pub fn total_items(&self) -> usize {
        self.visible_items().len()
    }

    /// Key prefix of the current folder: `""` at the root, `"a/c/"` below.
    pub fn path_prefix(&self) -> String {
        let path = &self.current_folder().path;
        if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        }
    }

    /// Folder names from the root down to the cursor.
    pub fn nav(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = self.tree.folder(self.cursor);
        while let Some(folder) = current {
            if folder.parent.is_none() {
                break;
            }
            names.push(folder.name.clone());
            current = folder.parent.and_then(|p| self.tree.folder(p));
        }
        names.reverse();
        names
    }

    /// Filter the current listing by name substring. An empty query clears
    /// the filter. The selection is always cleared.
    pub fn search(&mut self, query: &str) {
        self.search = if query.is_empty() {
            None
        } else {
            Some(query.to_string())
        };
        self.selection.clear();
    }

    pub fn search_query(&self) -> Option<&str> {
        self.search.as_deref()
    }

    pub fn visible_items(&self) -> Vec<&Node> {
        self.tree
            .children(self.cursor)
            .filter(|node| match &self.search {
                Some(query) => node.name().contains(query.as_str()),
                None => true,
            })
            .collect()
    }

    fn is_visible(&self, id: NodeId) -> bool {
        self.visible_items().iter().any(|node| node.id() == id)
    }

    /// Add a file from the current listing to the selection.
    pub fn select(&mut self, id: NodeId) -> EngineResult<()> {
        match self.tree.get_item(id)? {
            Node::Folder(folder) => Err(EngineError::invalid(format!(
                "'{}' is a folder and cannot be selected",
                folder.name
            ))),
            Node::File(file) if !self.is_visible(id) => Err(EngineError::invalid(format!(
                "'{}' is not in the current listing",
                file.name
            ))),
            Node::File(_) => {
                self.selection.insert(id);
                Ok(())
            }
        }
    }

    pub fn deselect(&mut self, id: NodeId) -> bool {
        self.selection.remove(&id)
    }

    /// Select every visible file.
    pub fn select_all(&mut self) {
        let files: Vec<NodeId> = self
            .visible_items()
            .into_iter()
            .filter(|node| !node.is_folder())
            .map(Node::id)
            .collect();
        self.selection.extend(files);
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn is_selected(&self, id: NodeId) -> bool {
        self.selection.contains(&id)
    }

    pub fn selection(&self) -> Vec<NodeId> {
        self.selection.iter().copied().collect()
    }

    pub fn selected_files(&self) -> Vec<&FileNode> {
        self.selection
            .iter()
            .filter_map(|id| self.tree.get(*id).and_then(Node::as_file))
            .collect()
    }

    /// Files a bulk operation acts on: the selection when it is non-empty,
    /// otherwise everything at or below `context` (the item the user acted
    /// on), otherwise nothing.
    pub fn operation_files(&self, context: Option<NodeId>) -> EngineResult<FileWalker<'_>> {
        let roots = if !self.selection.is_empty() {
            self.selection()
        } else if let Some(id) = context {
            self.tree.get_item(id)?;
            vec![id]
        } else {
            Vec::new()
        };
        Ok(FileWalker::new(&self.tree, roots))
    }
}
