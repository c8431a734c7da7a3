//! Schema introspection.
//!
//! Structure comes from `sqlite_master` and the `pragma_table_info`,
//! `pragma_index_list`, `pragma_index_info` and `pragma_foreign_key_list`
//! table functions. SQLite does not keep constraint names in its catalog, so
//! named `PRIMARY KEY`, `UNIQUE` and `FOREIGN KEY` constraints are read back
//! from the stored `CREATE TABLE` text. Unnamed ones get the names the
//! action model would have given them (`uq_<table>_<cols>`,
//! `fk_<table>_<cols>_<referenced>`).

use std::sync::LazyLock;

use regex_lite::Regex;
use rusqlite::Connection;
use strata_migrate::snapshot::{ObjectType, Snapshot, SnapshotFilter};
use strata_migrate::{DataType, ReferentialAction};
use tracing::debug;

use crate::error::{SqliteError, SqliteResult};

static NAMED_CONSTRAINT: LazyLock<Result<Regex, regex_lite::Error>> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)CONSTRAINT\s+["`\[]?(\w+)["`\]]?\s+(PRIMARY\s+KEY|UNIQUE|FOREIGN\s+KEY)\s*\(([^)]*)\)"#,
    )
});

static AUTOINCREMENT: LazyLock<Result<Regex, regex_lite::Error>> =
    LazyLock::new(|| Regex::new(r"(?i)\bAUTOINCREMENT\b"));

static VIEW_BODY: LazyLock<Result<Regex, regex_lite::Error>> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*CREATE\s+(?:TEMP\w*\s+)?VIEW\s+(?:IF\s+NOT\s+EXISTS\s+)?\S+\s+AS\s+(.*)$"#)
});

fn pattern(re: &'static LazyLock<Result<Regex, regex_lite::Error>>) -> SqliteResult<&'static Regex> {
    LazyLock::force(re)
        .as_ref()
        .map_err(|e| SqliteError::introspection(format!("invalid pattern: {}", e)))
}

#[derive(Debug, Clone)]
pub(crate) struct RawSchema {
    pub tables: Vec<RawTable>,
    pub views: Vec<RawView>,
}

#[derive(Debug, Clone)]
pub(crate) struct RawTable {
    pub name: String,
    pub sql: String,
    pub columns: Vec<RawColumn>,
    pub indexes: Vec<RawIndex>,
    pub foreign_keys: Vec<RawForeignKey>,
}

#[derive(Debug, Clone)]
pub(crate) struct RawColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// 1-based position in the primary key, 0 if not part of it.
    pub pk: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct RawIndex {
    pub name: String,
    pub unique: bool,
    /// `c` for CREATE INDEX, `u` for UNIQUE constraints, `pk` for the key.
    pub origin: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RawForeignKey {
    pub referenced_table: String,
    pub columns: Vec<String>,
    pub referenced_columns: Vec<String>,
    pub on_update: String,
    pub on_delete: String,
}

#[derive(Debug, Clone)]
pub(crate) struct RawView {
    pub name: String,
    pub sql: String,
}

/// Read raw catalog data. Runs on the connection thread.
pub(crate) fn read_schema(conn: &Connection) -> rusqlite::Result<RawSchema> {
    let catalog = |kind: &str| -> rusqlite::Result<Vec<(String, String)>> {
        let mut stmt = conn.prepare(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let rows = stmt
            .query_map([kind], |r| {
                Ok((r.get(0)?, r.get::<_, Option<String>>(1)?.unwrap_or_default()))
            })?
            .collect::<rusqlite::Result<Vec<_>>>();
        rows
    };

    let mut tables = Vec::new();
    for (name, sql) in catalog("table")? {
        tables.push(RawTable {
            columns: read_columns(conn, &name)?,
            indexes: read_indexes(conn, &name)?,
            foreign_keys: read_foreign_keys(conn, &name)?,
            name,
            sql,
        });
    }
    let views = catalog("view")?
        .into_iter()
        .map(|(name, sql)| RawView { name, sql })
        .collect();

    Ok(RawSchema { tables, views })
}

fn read_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<RawColumn>> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map([table], |r| {
            Ok(RawColumn {
                name: r.get(0)?,
                declared_type: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                not_null: r.get::<_, i64>(2)? != 0,
                default: r.get(3)?,
                pk: r.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>();
    columns
}

fn read_indexes(conn: &Connection, table: &str) -> rusqlite::Result<Vec<RawIndex>> {
    let mut list = conn.prepare(
        "SELECT name, \"unique\", origin FROM pragma_index_list(?1) ORDER BY name",
    )?;
    let entries = list
        .query_map([table], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0, r.get::<_, String>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let mut indexes = Vec::new();
    for (name, unique, origin) in entries {
        // Expression columns have no name.
        let columns = info
            .query_map([&name], |r| r.get::<_, Option<String>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        indexes.push(RawIndex {
            name,
            unique,
            origin,
            columns,
        });
    }
    Ok(indexes)
}

fn read_foreign_keys(conn: &Connection, table: &str) -> rusqlite::Result<Vec<RawForeignKey>> {
    let mut stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete \
         FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let rows = stmt
        .query_map([table], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut keys: Vec<(i64, RawForeignKey)> = Vec::new();
    for (id, referenced_table, from, to, on_update, on_delete) in rows {
        match keys.last_mut() {
            Some((last, fk)) if *last == id => {
                fk.columns.push(from);
                fk.referenced_columns.extend(to);
            }
            _ => keys.push((
                id,
                RawForeignKey {
                    referenced_table,
                    columns: vec![from],
                    referenced_columns: to.into_iter().collect(),
                    on_update,
                    on_delete,
                },
            )),
        }
    }
    Ok(keys.into_iter().map(|(_, fk)| fk).collect())
}

/// Constraint names declared in a `CREATE TABLE` statement.
#[derive(Debug, Default)]
struct NamedConstraints {
    primary_key: Option<String>,
    unique: Vec<(String, Vec<String>)>,
    foreign: Vec<(String, Vec<String>)>,
}

impl NamedConstraints {
    fn parse(sql: &str) -> SqliteResult<Self> {
        let mut named = Self::default();
        for caps in pattern(&NAMED_CONSTRAINT)?.captures_iter(sql) {
            let name = caps[1].to_string();
            let columns: Vec<String> = caps[3]
                .split(',')
                .map(|c| unquote(c.trim()).to_string())
                .collect();
            let kind = caps[2].to_uppercase();
            if kind.starts_with("PRIMARY") {
                named.primary_key = Some(name);
            } else if kind == "UNIQUE" {
                named.unique.push((name, columns));
            } else {
                named.foreign.push((name, columns));
            }
        }
        Ok(named)
    }

    fn find(list: &[(String, Vec<String>)], columns: &[String]) -> Option<String> {
        list.iter()
            .find(|(_, cols)| cols.as_slice() == columns)
            .map(|(name, _)| name.clone())
    }
}

fn unquote(ident: &str) -> &str {
    ident.trim_matches(|c: char| matches!(c, '"' | '`' | '[' | ']'))
}

/// `CREATE VIEW v AS <body>` to `<body>`.
fn view_definition(sql: &str) -> SqliteResult<String> {
    Ok(pattern(&VIEW_BODY)?
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map_or_else(|| sql.trim().to_string(), |m| m.as_str().trim().to_string()))
}

fn referential(raw: &str) -> Option<ReferentialAction> {
    ReferentialAction::parse(raw).filter(|a| *a != ReferentialAction::NoAction)
}

/// Assemble a snapshot from raw catalog data.
pub(crate) fn build_snapshot(schema: &RawSchema, filter: &SnapshotFilter) -> SqliteResult<Snapshot> {
    let model = |e: strata_migrate::MigrationError| SqliteError::introspection(e.to_string());
    let mut builder = Snapshot::builder().with_dialect("sqlite");

    for table in &schema.tables {
        if !filter.admits(ObjectType::Table, &table.name) {
            continue;
        }
        let name = table.name.as_str();
        let named = NamedConstraints::parse(&table.sql)?;
        builder.add_table(name).map_err(model)?;

        let mut pk: Vec<&RawColumn> = table.columns.iter().filter(|c| c.pk > 0).collect();
        pk.sort_by_key(|c| c.pk);
        let rowid_alias = pk.len() == 1
            && DataType::parse(&pk[0].declared_type) == DataType::Integer
            && pattern(&AUTOINCREMENT)?.is_match(&table.sql);

        for raw in &table.columns {
            let column = builder
                .add_column(name, &raw.name, &raw.declared_type)
                .map_err(model)?;
            column.nullable = !raw.not_null && raw.pk == 0;
            column.default = raw.default.clone();
            column.auto_increment = rowid_alias && raw.pk > 0;
        }
        if !pk.is_empty() {
            let columns = pk.iter().map(|c| c.name.clone()).collect();
            builder
                .set_primary_key(name, named.primary_key.clone(), columns)
                .map_err(model)?;
        }

        for index in &table.indexes {
            match index.origin.as_str() {
                "u" => {
                    let constraint = NamedConstraints::find(&named.unique, &index.columns)
                        .unwrap_or_else(|| format!("uq_{}_{}", name, index.columns.join("_")));
                    builder
                        .add_unique_constraint(name, &constraint, index.columns.clone())
                        .map_err(model)?;
                }
                "c" => builder
                    .add_index(name, &index.name, index.columns.clone(), index.unique)
                    .map_err(model)?,
                _ => {}
            }
        }

        for fk in &table.foreign_keys {
            let constraint = NamedConstraints::find(&named.foreign, &fk.columns).unwrap_or_else(|| {
                format!("fk_{}_{}_{}", name, fk.columns.join("_"), fk.referenced_table)
            });
            let added = builder
                .add_foreign_key(
                    name,
                    &constraint,
                    fk.columns.clone(),
                    &fk.referenced_table,
                    fk.referenced_columns.clone(),
                )
                .map_err(model)?;
            added.on_delete = referential(&fk.on_delete);
            added.on_update = referential(&fk.on_update);
        }
    }

    for view in &schema.views {
        if filter.admits(ObjectType::View, &view.name) {
            builder.add_view(&view.name, &view_definition(&view.sql)?);
        }
    }

    let snapshot = builder.build().filtered(filter);
    debug!(objects = snapshot.object_count(), "Introspected SQLite schema");
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schema(sql: &str) -> Snapshot {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(sql).unwrap();
        let raw = read_schema(&conn).unwrap();
        build_snapshot(&raw, &SnapshotFilter::all()).unwrap()
    }

    #[test]
    fn test_columns_and_keys() {
        let snapshot = schema(
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             email VARCHAR(255) NOT NULL, status TEXT DEFAULT 'open', \
             CONSTRAINT uq_accounts_email UNIQUE (email));",
        );

        let id = snapshot.column("accounts", "id").unwrap();
        assert!(id.auto_increment);
        assert!(!id.nullable);
        let email = snapshot.column("accounts", "email").unwrap();
        assert_eq!(email.data_type, "VARCHAR(255)");
        assert!(!email.nullable);
        let status = snapshot.column("accounts", "status").unwrap();
        assert_eq!(status.default.as_deref(), Some("'open'"));
        assert!(status.nullable);

        let table = snapshot.table_id("accounts").unwrap();
        assert_eq!(snapshot.primary_key(table).unwrap().columns, vec!["id"]);
        assert_eq!(snapshot.unique_constraints()[0].name, "uq_accounts_email");
    }

    #[test]
    fn test_named_and_synthesized_constraints() {
        let snapshot = schema(
            "CREATE TABLE a (id INTEGER NOT NULL, code TEXT UNIQUE, PRIMARY KEY (id));
             CREATE TABLE b (id INTEGER NOT NULL, a_id INTEGER, other INTEGER,
                CONSTRAINT fk_b_a FOREIGN KEY (a_id) REFERENCES a (id) ON DELETE CASCADE,
                FOREIGN KEY (other) REFERENCES a (id));
             CREATE INDEX idx_b_other ON b (other);",
        );

        assert_eq!(snapshot.unique_constraints()[0].name, "uq_a_code");
        let names: Vec<&str> = snapshot.foreign_keys().iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"fk_b_a"));
        assert!(names.contains(&"fk_b_other_a"));
        let cascade = snapshot.foreign_keys().iter().find(|f| f.name == "fk_b_a").unwrap();
        assert_eq!(cascade.on_delete, Some(ReferentialAction::Cascade));
        assert_eq!(cascade.on_update, None);
        assert!(snapshot.has_index(Some("b"), "idx_b_other"));
        assert!(!snapshot.column("a", "id").unwrap().auto_increment);
    }

    #[test]
    fn test_views_and_filter() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER);
             CREATE TABLE strata_changelog (id TEXT);
             CREATE VIEW v AS SELECT id FROM t;",
        )
        .unwrap();
        let raw = read_schema(&conn).unwrap();

        let all = build_snapshot(&raw, &SnapshotFilter::all()).unwrap();
        assert_eq!(all.views()[0].definition, "SELECT id FROM t");

        let filter = SnapshotFilter::all().exclude("strata_.*").unwrap();
        let filtered = build_snapshot(&raw, &filter).unwrap();
        assert!(filtered.has_table("t"));
        assert!(!filtered.has_table("strata_changelog"));
    }
}
