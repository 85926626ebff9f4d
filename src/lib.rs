pub mod analysis;
pub mod capture;
pub mod capture_log;
pub mod config;
pub mod engine;
pub mod focus;
pub mod learning;
pub mod frontmost;
pub mod logging;
pub mod notification;
pub mod paths;
pub mod permissions;
pub mod pool;
pub mod prompt;
pub mod scheduler;
pub mod screenshot;
pub mod session;
pub mod storage;
pub mod system_activity;
pub mod worker;
