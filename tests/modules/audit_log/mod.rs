//! audit_log 模块测试
