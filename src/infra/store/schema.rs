//! Relational layout of the durable store (schema only; no client is wired).
//!
//! Integrators backing `DurableStore` with a SQL database apply these
//! statements in order.

/// Migration statements creating the four tables and their indexes.
#[must_use]
pub fn migrations() -> &'static [&'static str] {
    &[
        r"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    func_name TEXT NOT NULL,
    args JSONB NOT NULL,
    kwargs JSONB NOT NULL,
    metadata JSONB NOT NULL,
    status TEXT NOT NULL,
    result JSONB,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks (created_at);
",
        r"
CREATE TABLE IF NOT EXISTS task_execution_history (
    id BIGSERIAL PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks (id),
    status TEXT NOT NULL,
    execution_time DOUBLE PRECISION,
    resource_usage JSONB,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
",
        r"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    data JSONB NOT NULL,
    metadata JSONB NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_events_status ON events (status);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at);
",
        r"
CREATE TABLE IF NOT EXISTS event_execution_history (
    id BIGSERIAL PRIMARY KEY,
    event_id TEXT NOT NULL REFERENCES events (id),
    handler_name TEXT NOT NULL,
    status TEXT NOT NULL,
    result JSONB,
    error_message TEXT,
    processing_time DOUBLE PRECISION,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
",
    ]
}
