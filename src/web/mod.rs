pub mod inference;
pub mod server;
