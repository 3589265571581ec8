// Session Keeper - Library root

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod context;
pub mod error;
pub mod http_client;
pub mod middleware;
pub mod routes;
pub mod session;
pub mod ssr;
