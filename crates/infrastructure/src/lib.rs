//! # 基础设施层
//!
//! 持久化与外部连接的具体实现：
//! - `database`：SQLite 仓储实现、表结构迁移、连接池管理
//! - `firmware_catalog`：从 TOML 文件导入固件镜像和升级边
//! - `reachability`：设备唤醒策略（HTTP 连接请求、UDP 汇合、XMPP 网关）

pub mod database;
pub mod firmware_catalog;
pub mod reachability;

pub use database::{
    run_migrations, DatabaseManager, SqliteDeviceRepository, SqliteExecutionRepository,
    SqliteFirmwareRepository, SqliteGroupRepository, SqliteTaskRepository,
    SqliteWorkflowRepository,
};
pub use firmware_catalog::FirmwareCatalog;
pub use reachability::{
    build_strategies, HttpConnectionRequestStrategy, UdpRendezvousStrategy, XmppPresenceStrategy,
};
