use fleet_core::FleetResult;
use sqlx::SqlitePool;
use tracing::debug;

/// 建表语句，按外键依赖顺序排列
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id TEXT PRIMARY KEY,
        manufacturer TEXT NOT NULL DEFAULT '',
        model TEXT NOT NULL DEFAULT '',
        device_type TEXT NOT NULL DEFAULT '',
        firmware_version TEXT NOT NULL DEFAULT '',
        online INTEGER NOT NULL DEFAULT 0,
        last_contact_at TEXT,
        connection_request_url TEXT,
        udp_rendezvous_addr TEXT,
        xmpp_jid TEXT,
        stun_enabled INTEGER NOT NULL DEFAULT 0,
        parent_device_id TEXT,
        attributes TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS device_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        match_type TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        priority INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL REFERENCES device_groups(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        field TEXT NOT NULL,
        operator TEXT NOT NULL,
        value TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        group_id INTEGER NOT NULL REFERENCES device_groups(id),
        task_kind TEXT NOT NULL,
        parameters TEXT NOT NULL DEFAULT '{}',
        schedule_mode TEXT NOT NULL,
        scheduled_at TEXT,
        cron_expression TEXT,
        rate_limit INTEGER NOT NULL DEFAULT 0,
        max_concurrent INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        retry_delay_minutes INTEGER NOT NULL DEFAULT 0,
        stop_on_failure_percent INTEGER NOT NULL DEFAULT 0,
        depends_on_workflow_id INTEGER REFERENCES workflows(id),
        run_once_per_device INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL,
        activated_at TEXT,
        last_fired_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id INTEGER NOT NULL REFERENCES workflows(id),
        device_id TEXT NOT NULL,
        status TEXT NOT NULL,
        task_id INTEGER,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_retry_at TEXT,
        result TEXT,
        scheduled_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        updated_at TEXT NOT NULL,
        UNIQUE(workflow_id, device_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL,
        resend_count INTEGER NOT NULL DEFAULT 0,
        result TEXT,
        error TEXT,
        initiated_by TEXT,
        workflow_id INTEGER,
        execution_id INTEGER,
        sent_at TEXT,
        deadline_at TEXT,
        completed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS firmware_images (
        device_type TEXT NOT NULL,
        version TEXT NOT NULL,
        download_ref TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (device_type, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS firmware_upgrade_edges (
        device_type TEXT NOT NULL,
        from_version TEXT NOT NULL,
        to_version TEXT NOT NULL,
        PRIMARY KEY (device_type, from_version, to_version)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_group_rules_group ON group_rules(group_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status)",
    "CREATE INDEX IF NOT EXISTS idx_executions_workflow_status ON executions(workflow_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_executions_device ON executions(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_device_status ON tasks(device_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_deadline ON tasks(status, deadline_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_workflow_created ON tasks(workflow_id, created_at)",
];

/// 创建表结构和索引，可重复执行
pub async fn run_migrations(pool: &SqlitePool) -> FleetResult<()> {
    debug!("执行 SQLite 数据库迁移");

    for statement in SCHEMA.iter().chain(INDEXES) {
        sqlx::query(*statement).execute(pool).await?;
    }

    debug!("数据库迁移完成");
    Ok(())
}
