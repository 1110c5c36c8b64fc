pub mod connection;
pub mod entries;
pub mod migrations;
pub mod models;
