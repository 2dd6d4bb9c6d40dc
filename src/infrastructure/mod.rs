pub mod scratch;
pub mod transformer;
