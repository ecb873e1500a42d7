pub mod connection;
pub mod errors;
pub mod filter;
pub mod kernel;
pub mod manager;
pub mod model;
pub mod oracle;
pub mod prefs;
pub mod profile;
pub mod state;
