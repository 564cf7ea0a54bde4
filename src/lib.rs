pub mod config;
pub mod crawler;
pub mod database;
pub mod errors;
pub mod events;
pub mod logging;
pub mod migration;
pub mod models;
pub mod schedule;
pub mod scheduler;
pub mod sources;
pub mod sse;
pub mod web;
