pub mod sqlite_device_repository;
pub mod sqlite_execution_repository;
pub mod sqlite_firmware_repository;
pub mod sqlite_group_repository;
pub mod sqlite_task_repository;
pub mod sqlite_workflow_repository;

pub use sqlite_device_repository::SqliteDeviceRepository;
pub use sqlite_execution_repository::SqliteExecutionRepository;
pub use sqlite_firmware_repository::SqliteFirmwareRepository;
pub use sqlite_group_repository::SqliteGroupRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
pub use sqlite_workflow_repository::SqliteWorkflowRepository;
