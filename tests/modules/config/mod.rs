//! config 模块测试

mod integration;
