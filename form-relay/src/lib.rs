pub mod api;
pub mod auth;
pub mod collab;
pub mod config;
pub mod connect;
pub mod error;
pub mod events;
pub mod frame;
pub mod gateway;
pub mod hub;
pub mod link;
pub mod message;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod retry;
pub mod score;
pub mod select;
pub mod session;
pub mod store;
pub mod tunnel;
pub mod warm;
