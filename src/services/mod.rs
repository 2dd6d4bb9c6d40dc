pub mod archive;
pub mod pipeline;
pub mod transformer;
pub mod tree_walker;
pub mod worker;
pub mod workspace;
