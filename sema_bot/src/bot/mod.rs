pub mod answers;
pub mod callbacks;
pub mod handler;
pub mod handler_tree;
