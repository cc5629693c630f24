pub mod config;
pub mod database;
pub mod error;
pub mod validation;
pub mod state;
pub mod auth;
pub mod users;
pub mod projects;
pub mod chat;
pub mod payments;
pub mod notifications;
pub mod websocket;
pub mod routes;
