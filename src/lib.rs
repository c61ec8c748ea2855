pub mod api;
pub mod common_utils;
pub mod configure;
pub mod event_log;
pub mod logger;
pub mod transfer;
