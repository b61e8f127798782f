//! Database schema definitions for the ledger store.
//!
//! One SQLite database holds all five tables. `orders.energy_cost` is the
//! cost snapshot taken when the line was placed; refunds always use it, so
//! later menu price edits never disturb committed ledger effects.

pub const LEDGER_SCHEMA_VERSION: u32 = 2;

pub const LEDGER_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const LEDGER_DB_SCHEMA_USERS: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT UNIQUE NOT NULL,
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL CHECK (role IN ('guest', 'admin')),
        created_at TEXT NOT NULL
    )
";

pub const LEDGER_DB_SCHEMA_MENUS: &str = "
    CREATE TABLE IF NOT EXISTS menus (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT UNIQUE NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        energy_cost INTEGER NOT NULL CHECK (energy_cost > 0),
        image_urls TEXT NOT NULL DEFAULT '[]'
    )
";

pub const LEDGER_DB_SCHEMA_PARTIES: &str = "
    CREATE TABLE IF NOT EXISTS parties (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT UNIQUE NOT NULL,
        credential_hash TEXT NOT NULL,
        initial_budget INTEGER NOT NULL CHECK (initial_budget > 0),
        energy_budget INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        CHECK (energy_budget >= 0 AND energy_budget <= initial_budget)
    )
";

pub const LEDGER_DB_SCHEMA_MEMBERSHIPS: &str = "
    CREATE TABLE IF NOT EXISTS memberships (
        party_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        joined_at TEXT NOT NULL,
        PRIMARY KEY (party_id, user_id),
        FOREIGN KEY (party_id) REFERENCES parties(id),
        FOREIGN KEY (user_id) REFERENCES users(id)
    )
";

pub const LEDGER_DB_SCHEMA_ORDERS: &str = "
    CREATE TABLE IF NOT EXISTS orders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        party_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        menu_id INTEGER NOT NULL,
        energy_cost INTEGER NOT NULL CHECK (energy_cost > 0),
        request_token TEXT UNIQUE,
        created_at TEXT NOT NULL,
        FOREIGN KEY (party_id) REFERENCES parties(id),
        FOREIGN KEY (user_id) REFERENCES users(id),
        FOREIGN KEY (menu_id) REFERENCES menus(id)
    )
";

pub const LEDGER_DB_SCHEMA_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_orders_party ON orders(party_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_menu ON orders(menu_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_user_party ON orders(user_id, party_id)",
    "CREATE INDEX IF NOT EXISTS idx_memberships_user ON memberships(user_id)",
];

/// Table DDL in dependency order.
pub const LEDGER_DB_TABLES: &[&str] = &[
    LEDGER_DB_SCHEMA_META,
    LEDGER_DB_SCHEMA_USERS,
    LEDGER_DB_SCHEMA_MENUS,
    LEDGER_DB_SCHEMA_PARTIES,
    LEDGER_DB_SCHEMA_MEMBERSHIPS,
    LEDGER_DB_SCHEMA_ORDERS,
];
