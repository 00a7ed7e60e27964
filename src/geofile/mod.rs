pub mod feature;
pub mod writer;
