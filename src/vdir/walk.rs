use super::tree::{FileNode, Node, NodeId, VirtualTree};

/// Lazily yields every file at or below a set of starting nodes, depth-first
/// in listing order. Clones walk independently; `restart` rewinds.
#[derive(Debug, Clone)]
pub struct FileWalker<'a> {
    tree: &'a VirtualTree,
    roots: Vec<NodeId>,
    stack: Vec<NodeId>,
}

impl<'a> FileWalker<'a> {
    pub fn new(tree: &'a VirtualTree, roots: Vec<NodeId>) -> Self {
        let mut walker = Self {
            tree,
            roots,
            stack: Vec::new(),
        };
        walker.restart();
        walker
    }

    pub fn restart(&mut self) {
        self.stack.clear();
        self.stack.extend(self.roots.iter().rev().copied());
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }
}

impl<'a> Iterator for FileWalker<'a> {
    type Item = &'a FileNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            match self.tree.get(id) {
                Some(Node::File(file)) => return Some(file),
                Some(Node::Folder(folder)) => {
                    self.stack.extend(folder.children.iter().rev().copied());
                }
                None => {}
            }
        }
        None
    }
}
