//! Schema migration, applied idempotently at startup.
//!
//! SQLite has no schema namespaces, so the `inventory`/`i18n` logical
//! schemas named in the interface design are realized as table prefixes.

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS classifiers (
    id   TEXT PRIMARY KEY,
    code TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS classifier_items (
    id            TEXT PRIMARY KEY,
    classifier_id TEXT NOT NULL REFERENCES classifiers(id),
    code          TEXT NOT NULL,
    description   TEXT NOT NULL DEFAULT '',
    UNIQUE (classifier_id, code)
);
CREATE INDEX IF NOT EXISTS idx_classifier_items_classifier ON classifier_items(classifier_id);

CREATE TABLE IF NOT EXISTS items (
    id                          TEXT PRIMARY KEY,
    item_class_id               TEXT NOT NULL REFERENCES classifier_items(id),
    item_type_id                TEXT NOT NULL REFERENCES classifier_items(id),
    quality_levels_classifier_id TEXT NOT NULL REFERENCES classifiers(id),
    collections_classifier_id   TEXT NOT NULL REFERENCES classifiers(id)
);

CREATE TABLE IF NOT EXISTS item_images (
    item_id          TEXT NOT NULL REFERENCES items(id),
    collection_id    TEXT NOT NULL REFERENCES classifier_items(id),
    quality_level_id TEXT NOT NULL REFERENCES classifier_items(id),
    image_url        TEXT NOT NULL,
    PRIMARY KEY (item_id, collection_id, quality_level_id)
);

CREATE TABLE IF NOT EXISTS operations (
    rowid_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    id                TEXT NOT NULL UNIQUE,
    user_id           TEXT NOT NULL,
    section_id        TEXT NOT NULL REFERENCES classifier_items(id),
    item_id           TEXT NOT NULL REFERENCES items(id),
    collection_id     TEXT NOT NULL REFERENCES classifier_items(id),
    quality_level_id  TEXT NOT NULL REFERENCES classifier_items(id),
    quantity_change   INTEGER NOT NULL,
    operation_type_id TEXT NOT NULL REFERENCES classifier_items(id),
    operation_id      TEXT,
    recipe_id         TEXT,
    comment           TEXT,
    created_at        TEXT NOT NULL,
    CHECK (quantity_change != 0)
);

CREATE INDEX IF NOT EXISTS idx_operations_balance_key
    ON operations(user_id, section_id, item_id, collection_id, quality_level_id, created_at);
CREATE INDEX IF NOT EXISTS idx_operations_operation_id ON operations(operation_id);

CREATE TABLE IF NOT EXISTS daily_balances (
    user_id          TEXT NOT NULL,
    section_id       TEXT NOT NULL REFERENCES classifier_items(id),
    item_id          TEXT NOT NULL REFERENCES items(id),
    collection_id    TEXT NOT NULL REFERENCES classifier_items(id),
    quality_level_id TEXT NOT NULL REFERENCES classifier_items(id),
    balance_date     TEXT NOT NULL,
    quantity         INTEGER NOT NULL,
    created_at       TEXT NOT NULL,
    PRIMARY KEY (user_id, section_id, item_id, collection_id, quality_level_id, balance_date),
    CHECK (quantity >= 0)
);

-- Supports the locked read-and-check step of reserve/adjust; this index
-- matters even in this single-connection deployment because it is what a
-- multi-connection deployment would turn into `SELECT ... FOR UPDATE`.
CREATE INDEX IF NOT EXISTS idx_daily_balances_user_item_lock
    ON daily_balances(user_id, item_id, collection_id, quality_level_id, section_id, balance_date DESC);

CREATE TABLE IF NOT EXISTS i18n_languages (
    code       TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    is_active  INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS i18n_translations (
    entity_type   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    field_name    TEXT NOT NULL,
    language_code TEXT NOT NULL REFERENCES i18n_languages(code),
    content       TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id, field_name, language_code)
);

CREATE TABLE IF NOT EXISTS production_recipes (
    id TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS recipe_input_items (
    recipe_id        TEXT NOT NULL REFERENCES production_recipes(id),
    item_id          TEXT NOT NULL REFERENCES items(id),
    collection_id    TEXT NOT NULL REFERENCES classifier_items(id),
    quality_level_id TEXT NOT NULL REFERENCES classifier_items(id),
    quantity         INTEGER NOT NULL,
    PRIMARY KEY (recipe_id, item_id, collection_id, quality_level_id)
);

CREATE TABLE IF NOT EXISTS recipe_output_items (
    recipe_id        TEXT NOT NULL REFERENCES production_recipes(id),
    item_id          TEXT NOT NULL REFERENCES items(id),
    collection_id    TEXT NOT NULL REFERENCES classifier_items(id),
    quality_level_id TEXT NOT NULL REFERENCES classifier_items(id),
    min_quantity     INTEGER NOT NULL,
    max_quantity     INTEGER NOT NULL,
    probability      REAL NOT NULL,
    PRIMARY KEY (recipe_id, item_id, collection_id, quality_level_id)
);

CREATE TABLE IF NOT EXISTS production_tasks (
    id                   TEXT PRIMARY KEY,
    user_id              TEXT NOT NULL,
    recipe_id            TEXT NOT NULL REFERENCES production_recipes(id),
    slot_number          INTEGER NOT NULL,
    status               TEXT NOT NULL,
    started_at           TEXT,
    completion_time      TEXT,
    claimed_at           TEXT,
    pre_calculated_results TEXT,
    modifiers_applied    TEXT,
    reservation_id       TEXT,
    execution_count      INTEGER NOT NULL DEFAULT 1,
    created_at           TEXT NOT NULL
);

-- I5: at most one active task per (user, recipe).
CREATE UNIQUE INDEX IF NOT EXISTS idx_production_tasks_active
    ON production_tasks(user_id, recipe_id)
    WHERE status IN ('draft', 'pending', 'in_progress');

CREATE INDEX IF NOT EXISTS idx_production_tasks_reservation ON production_tasks(reservation_id);
"#;

/// Fixed reference data the registry in `classifier::ClassifierRegistry`
/// expects to find on a freshly migrated database (§4.1: "the registry is
/// seeded by the schema migration"). Ids are literal, not `uuid_v4()`-
/// generated, so re-running this against an already-seeded database is a
/// no-op rather than a duplicate-row error.
pub const SEED_SQL: &str = r#"
INSERT OR IGNORE INTO classifiers (id, code) VALUES
    ('00000000-0000-0000-0000-000000000001', 'inventory_section'),
    ('00000000-0000-0000-0000-000000000002', 'operation_type');

INSERT OR IGNORE INTO classifier_items (id, classifier_id, code, description) VALUES
    ('00000000-0000-0000-0001-000000000001', '00000000-0000-0000-0000-000000000001', 'main', 'Player-owned inventory'),
    ('00000000-0000-0000-0001-000000000002', '00000000-0000-0000-0000-000000000001', 'factory', 'Items held while reserved for production'),
    ('00000000-0000-0000-0001-000000000003', '00000000-0000-0000-0000-000000000001', 'trade', 'Items held while listed for trade'),
    ('00000000-0000-0000-0002-000000000001', '00000000-0000-0000-0000-000000000002', 'chest_reward', 'Credit from opening a reward chest'),
    ('00000000-0000-0000-0002-000000000002', '00000000-0000-0000-0000-000000000002', 'factory_reservation', 'Move from main to factory on reserve'),
    ('00000000-0000-0000-0002-000000000003', '00000000-0000-0000-0000-000000000002', 'factory_return', 'Move from factory back to main on return'),
    ('00000000-0000-0000-0002-000000000004', '00000000-0000-0000-0000-000000000002', 'factory_consumption', 'Debit from factory on consume'),
    ('00000000-0000-0000-0002-000000000005', '00000000-0000-0000-0000-000000000002', 'craft_result', 'Credit from a claimed production task'),
    ('00000000-0000-0000-0002-000000000006', '00000000-0000-0000-0000-000000000002', 'admin_adjustment', 'Signed balance correction by an operator');

INSERT OR IGNORE INTO i18n_languages (code, name, is_default, is_active) VALUES
    ('en', 'English', 1, 1);
"#;

/// Defense-in-depth: even though the application serializes writes on a
/// single connection mutex, this trigger rejects any `main`-section
/// operation that would drive the current balance negative. It MUST use the
/// same "since latest snapshot" window the application uses in
/// `balance::current_balance`, or the two can disagree (see SPEC_FULL.md
/// Design Notes, migration 006 vs 017).
pub const OVERSELL_TRIGGER_SQL: &str = r#"
CREATE TRIGGER IF NOT EXISTS trg_reject_main_oversell
BEFORE INSERT ON operations
WHEN NEW.quantity_change < 0
  AND NEW.section_id = (SELECT id FROM classifier_items WHERE code = 'main' LIMIT 1)
BEGIN
    SELECT RAISE(ABORT, 'insufficient_balance')
    WHERE (
        COALESCE(
            (SELECT quantity FROM daily_balances
             WHERE user_id = NEW.user_id
               AND section_id = NEW.section_id
               AND item_id = NEW.item_id
               AND collection_id = NEW.collection_id
               AND quality_level_id = NEW.quality_level_id
             ORDER BY balance_date DESC LIMIT 1),
            0
        )
        +
        COALESCE(
            (SELECT SUM(quantity_change) FROM operations
             WHERE user_id = NEW.user_id
               AND section_id = NEW.section_id
               AND item_id = NEW.item_id
               AND collection_id = NEW.collection_id
               AND quality_level_id = NEW.quality_level_id
               AND created_at > COALESCE(
                    (SELECT balance_date || 'T23:59:59+00:00' FROM daily_balances
                     WHERE user_id = NEW.user_id
                       AND section_id = NEW.section_id
                       AND item_id = NEW.item_id
                       AND collection_id = NEW.collection_id
                       AND quality_level_id = NEW.quality_level_id
                     ORDER BY balance_date DESC LIMIT 1),
                    '0000-00-00T00:00:00+00:00'
               )),
            0
        )
        + NEW.quantity_change
    ) < 0;
END;
"#;
