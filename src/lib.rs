pub mod admin;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod decoder;
pub mod dispatcher;
pub mod logging;
pub mod registry;
pub mod topic;
