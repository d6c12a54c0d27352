pub mod commands;
pub mod connection;
pub mod dispatcher;
