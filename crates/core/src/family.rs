use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured-query placeholder used when no family-specific default applies.
pub const PLACEHOLDER_QUERY: &str = "{}";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseFamily {
    MongoDb,
    Postgres,
    MySql,
    Sqlite,
    Redis,
    Mssql,
    Kafka,
}

/// Per-family defaults consumed by the tab session and the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyTraits {
    pub label: &'static str,
    pub default_query: &'static str,
    pub database_noun: &'static str,
    pub collection_noun: &'static str,
    pub default_port: Option<u16>,
    pub streaming: bool,
}

static FAMILY_TABLE: [(DatabaseFamily, FamilyTraits); 7] = [
    (
        DatabaseFamily::MongoDb,
        FamilyTraits {
            label: "MongoDB",
            default_query: PLACEHOLDER_QUERY,
            database_noun: "database",
            collection_noun: "collection",
            default_port: Some(27017),
            streaming: false,
        },
    ),
    (
        DatabaseFamily::Postgres,
        FamilyTraits {
            label: "PostgreSQL",
            default_query: "SELECT * FROM table_name LIMIT 100;",
            database_noun: "database",
            collection_noun: "table",
            default_port: Some(5432),
            streaming: false,
        },
    ),
    (
        DatabaseFamily::MySql,
        FamilyTraits {
            label: "MySQL",
            default_query: "SELECT * FROM table_name LIMIT 100;",
            database_noun: "database",
            collection_noun: "table",
            default_port: Some(3306),
            streaming: false,
        },
    ),
    (
        DatabaseFamily::Sqlite,
        FamilyTraits {
            label: "SQLite",
            default_query: "SELECT * FROM table_name LIMIT 100;",
            database_noun: "database",
            collection_noun: "table",
            default_port: None,
            streaming: false,
        },
    ),
    (
        DatabaseFamily::Redis,
        FamilyTraits {
            label: "Redis",
            default_query: "PING",
            database_noun: "database",
            collection_noun: "key",
            default_port: Some(6379),
            streaming: false,
        },
    ),
    (
        DatabaseFamily::Mssql,
        FamilyTraits {
            label: "SQL Server",
            default_query: "SELECT TOP 100 * FROM table_name;",
            database_noun: "database",
            collection_noun: "table",
            default_port: Some(1433),
            streaming: false,
        },
    ),
    (
        DatabaseFamily::Kafka,
        FamilyTraits {
            label: "Kafka",
            default_query: PLACEHOLDER_QUERY,
            database_noun: "cluster",
            collection_noun: "topic",
            default_port: Some(9092),
            streaming: true,
        },
    ),
];

impl DatabaseFamily {
    pub const ALL: [DatabaseFamily; 7] = [
        DatabaseFamily::MongoDb,
        DatabaseFamily::Postgres,
        DatabaseFamily::MySql,
        DatabaseFamily::Sqlite,
        DatabaseFamily::Redis,
        DatabaseFamily::Mssql,
        DatabaseFamily::Kafka,
    ];

    #[must_use]
    pub fn traits(self) -> &'static FamilyTraits {
        FAMILY_TABLE
            .iter()
            .find(|(family, _)| *family == self)
            .map(|(_, traits)| traits)
            .unwrap_or(&FAMILY_TABLE[0].1)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        self.traits().label
    }

    /// Accepts the loose spellings users type into config files.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mongodb" | "mongo" | "mongo_db" => Some(Self::MongoDb),
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "mysql" | "my_sql" | "mariadb" => Some(Self::MySql),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            "redis" => Some(Self::Redis),
            "mssql" | "sqlserver" | "sql_server" => Some(Self::Mssql),
            "kafka" => Some(Self::Kafka),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[must_use]
pub fn default_query(family: Option<DatabaseFamily>) -> &'static str {
    family.map_or(PLACEHOLDER_QUERY, |family| family.traits().default_query)
}
