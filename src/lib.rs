pub mod app;
pub mod builder;
pub mod catalogue;
pub mod classify;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod events;
pub mod fs_util;
pub mod output;
pub mod package;
pub mod session;
pub mod store;
pub mod transfer;
