//! Virtual directory model over flat object-storage listings

mod tree;
mod view;
mod walk;

pub use tree::{FileNode, FolderNode, Node, NodeId, VirtualTree};
pub use view::DirectoryView;
pub use walk::FileWalker;
