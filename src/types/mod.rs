pub mod commit;
pub mod tree;

pub use commit::Commit;
pub use tree::{EntryMode, Tree, TreeEntry};
