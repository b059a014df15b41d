pub mod connection;
pub mod entities;
pub mod migrate;
pub mod migrations;
#[cfg(test)]
pub mod test_utils;

pub use connection::*;
pub use entities::*;
