mod interface;
pub mod server;

pub use interface::*;
pub use server::{router, serve, CallerKey};
