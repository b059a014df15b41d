pub mod config;
pub mod errors;
pub mod jobs;
pub mod schema;
pub mod sync;
pub mod writer;

pub mod database;
pub mod services;
