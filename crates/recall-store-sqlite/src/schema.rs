//! SQL schema for the Recall SQLite store.
//!
//! Executed once at connection startup; idempotent thanks to
//! `CREATE TABLE IF NOT EXISTS`. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS queue_entries (
    id                        TEXT PRIMARY KEY,
    tenant_id                 TEXT NOT NULL,
    call_reference            TEXT NOT NULL,
    customer_phone            TEXT NOT NULL,
    status                    TEXT NOT NULL,    -- EntryStatus discriminant
    priority                  TEXT NOT NULL DEFAULT 'medium',
    priority_rank             INTEGER NOT NULL DEFAULT 1,
    sla_deadline              TEXT NOT NULL,    -- ISO 8601 UTC, wall-clock
    escalation_deadline       TEXT NOT NULL,
    next_attempt_at           TEXT NOT NULL,
    last_attempt_at           TEXT,
    attempt_count             INTEGER NOT NULL DEFAULT 0,
    max_attempts              INTEGER NOT NULL,
    ai_rescue_attempted       INTEGER NOT NULL DEFAULT 0,
    customer_responded        INTEGER NOT NULL DEFAULT 0,
    recovery_method           TEXT,
    consent_status            TEXT NOT NULL,
    opt_out_reason            TEXT,
    business_hours_override   INTEGER NOT NULL DEFAULT 0,
    data_retention_expires_at TEXT NOT NULL,
    created_at                TEXT NOT NULL,
    updated_at                TEXT NOT NULL,
    processed_at              TEXT,
    escalated_at              TEXT
);

-- Attempt log rows are append-only; never updated after insert.
CREATE TABLE IF NOT EXISTS attempts (
    id                   TEXT PRIMARY KEY,
    entry_id             TEXT NOT NULL REFERENCES queue_entries(id) ON DELETE CASCADE,
    attempt_number       INTEGER NOT NULL,
    method               TEXT NOT NULL,
    message_sent         TEXT,
    response_received    TEXT,
    ai_confidence_score  REAL,
    success              INTEGER NOT NULL,
    customer_engaged     INTEGER NOT NULL,
    escalation_triggered INTEGER NOT NULL,
    failure_reason       TEXT,
    attempted_at         TEXT NOT NULL,
    responded_at         TEXT,
    UNIQUE (entry_id, attempt_number)
);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    provider          TEXT NOT NULL,
    external_event_id TEXT NOT NULL,
    entry_id          TEXT,             -- stamped when the enqueue commits
    first_seen_at     TEXT NOT NULL,
    last_seen_at      TEXT NOT NULL,
    attempts          INTEGER NOT NULL DEFAULT 1,
    expires_at        TEXT NOT NULL,
    PRIMARY KEY (provider, external_event_id)
);

CREATE TABLE IF NOT EXISTS consent_records (
    tenant_id      TEXT NOT NULL,
    customer_phone TEXT NOT NULL,
    status         TEXT NOT NULL,
    opt_out_reason TEXT,
    updated_at     TEXT NOT NULL,
    PRIMARY KEY (tenant_id, customer_phone)
);

CREATE TABLE IF NOT EXISTS tenant_policies (
    tenant_id   TEXT PRIMARY KEY,
    policy_json TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS circuit_breakers (
    provider      TEXT NOT NULL,
    tenant_id     TEXT NOT NULL,
    state         TEXT NOT NULL DEFAULT 'closed',
    failure_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    opened_at     TEXT,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (provider, tenant_id)
);

-- Dead letters deliberately do not reference queue_entries: their retry
-- lifecycle is independent and may outlive the owning entry.
CREATE TABLE IF NOT EXISTS dead_letters (
    id             TEXT PRIMARY KEY,
    tenant_id      TEXT NOT NULL,
    entry_id       TEXT NOT NULL,
    method         TEXT NOT NULL,
    customer_phone TEXT NOT NULL,
    payload        TEXT NOT NULL,
    failure_reason TEXT NOT NULL,
    retry_count    INTEGER NOT NULL DEFAULT 0,
    max_retries    INTEGER NOT NULL,
    next_retry_at  TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'pending',
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

-- Audit rows are written in the same transaction as the mutation they
-- mirror. No UPDATE is ever issued; DELETE only by the retention sweeper.
CREATE TABLE IF NOT EXISTS audit_log (
    id         TEXT PRIMARY KEY,
    tenant_id  TEXT NOT NULL,
    entry_id   TEXT NOT NULL,
    action     TEXT NOT NULL,     -- 'insert' | 'update' | 'delete'
    old_values TEXT,              -- JSON snapshot or NULL
    new_values TEXT,
    changed_by TEXT NOT NULL,
    changed_at TEXT NOT NULL
);

-- Sliding-window ingestion counters, bucketed to 10-second resolution.
CREATE TABLE IF NOT EXISTS rate_buckets (
    tenant_id    TEXT NOT NULL,
    client_key   TEXT NOT NULL,
    bucket_start INTEGER NOT NULL, -- unix seconds, truncated to bucket size
    count        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tenant_id, client_key, bucket_start)
);

CREATE TABLE IF NOT EXISTS rate_blocks (
    tenant_id     TEXT NOT NULL,
    client_key    TEXT NOT NULL,
    blocked_until TEXT NOT NULL,
    PRIMARY KEY (tenant_id, client_key)
);

CREATE INDEX IF NOT EXISTS entries_due_idx       ON queue_entries(status, next_attempt_at);
CREATE INDEX IF NOT EXISTS entries_tenant_idx    ON queue_entries(tenant_id);
CREATE INDEX IF NOT EXISTS entries_escalation_idx ON queue_entries(escalation_deadline);
CREATE INDEX IF NOT EXISTS entries_retention_idx ON queue_entries(data_retention_expires_at);
CREATE INDEX IF NOT EXISTS attempts_entry_idx    ON attempts(entry_id);
CREATE INDEX IF NOT EXISTS dead_letters_due_idx  ON dead_letters(status, next_retry_at);
CREATE INDEX IF NOT EXISTS audit_entry_idx       ON audit_log(entry_id);
CREATE INDEX IF NOT EXISTS audit_changed_idx     ON audit_log(changed_at);
CREATE INDEX IF NOT EXISTS idempotency_exp_idx   ON idempotency_keys(expires_at);

PRAGMA user_version = 1;
";
