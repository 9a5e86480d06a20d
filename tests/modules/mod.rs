//! 测试模块根目录
//!
//! 每个功能模块一个子目录

mod audit_log;
mod config;
mod governor;
mod storage;
