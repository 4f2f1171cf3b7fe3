//! Table definitions for both dialects.
//!
//! Tables:
//! - `access_tokens`: id, data, expires
//! - `one_time_tokens`: id, data, expires
//! - `keys`: name, data
//! - `hashes`: hash, pepper, algorithm, medium, value

use super::Dialect;

/// DDL statements, safe to run on every start.
pub fn statements(dialect: Dialect) -> Vec<String> {
    // PostgreSQL binds i64 parameters as INT8 only.
    let int = match dialect {
        Dialect::Sqlite => "INTEGER",
        Dialect::Postgres => "BIGINT",
    };

    let mut ddl = Vec::new();
    for table in ["access_tokens", "one_time_tokens"] {
        ddl.push(format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                \"id\" VARCHAR(64) PRIMARY KEY,
                \"data\" TEXT NOT NULL,
                \"expires\" {int}
            )"
        ));
        ddl.push(format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{table}_expires\" ON \"{table}\" (\"expires\")"
        ));
    }
    ddl.push(
        "CREATE TABLE IF NOT EXISTS \"keys\" (
            \"name\" VARCHAR(32) PRIMARY KEY,
            \"data\" TEXT NOT NULL
        )"
        .to_string(),
    );
    ddl.push(
        "CREATE TABLE IF NOT EXISTS \"hashes\" (
            \"hash\" VARCHAR(128) NOT NULL,
            \"pepper\" VARCHAR(64) NOT NULL,
            \"algorithm\" VARCHAR(16) NOT NULL,
            \"medium\" VARCHAR(16) NOT NULL,
            \"value\" TEXT NOT NULL
        )"
        .to_string(),
    );
    // One row per hash under a pepper; also serves lookups by hash.
    ddl.push(
        "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_hashes_hash_pepper\" ON \"hashes\" (\"hash\", \"pepper\")"
            .to_string(),
    );
    ddl.push(
        "CREATE INDEX IF NOT EXISTS \"idx_hashes_pepper\" ON \"hashes\" (\"pepper\")".to_string(),
    );
    ddl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_type_follows_dialect() {
        let lite = statements(Dialect::Sqlite).join("\n");
        let pg = statements(Dialect::Postgres).join("\n");
        assert!(lite.contains("\"expires\" INTEGER"));
        assert!(pg.contains("\"expires\" BIGINT"));
        assert!(!lite.contains("BIGINT"));
    }

    #[test]
    fn hashes_are_unique_per_pepper() {
        for dialect in [Dialect::Sqlite, Dialect::Postgres] {
            let ddl = statements(dialect).join("\n");
            assert!(ddl.contains(
                "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_hashes_hash_pepper\" ON \"hashes\" (\"hash\", \"pepper\")"
            ));
        }
    }
}
