//! In-memory database for unit tests.
//!
//! Interprets exactly the statement shapes this crate generates: SELECT INTO
//! from a VALUES relation or a table, INSERT ... SELECT from either, the merge
//! UPDATE, DROP TABLE IF EXISTS, and cursor SELECTs. Values are normalised to
//! their column type on the way in so comparisons behave like the server's.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use crate::core::identifier::{Ident, TableName};
use crate::core::schema::{ColumnDescriptor, TableDescriptor};
use crate::core::traits::{Catalog, RowCursor, Session};
use crate::core::value::{Batch, Row, SqlValue};
use crate::error::{Result, RowMergeError};
use crate::typemap::{map_type_name, ColumnType};

#[derive(Debug, Clone)]
struct MockTable {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Vec<SqlValue>>,
}

impl MockTable {
    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.as_str() == name)
    }
}

#[derive(Debug, Clone)]
struct Failure {
    needle: String,
    code: Option<String>,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, MockTable>,
    statements: Vec<String>,
    failures: Vec<Failure>,
    fetch_sizes: Vec<usize>,
    cursors_opened: usize,
}

/// In-memory [`Catalog`] + [`Session`].
#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<State>>,
    open_cursors: Arc<AtomicUsize>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table named `schema.table` with `(name, sql type)` columns.
    pub fn add_table(&self, name: &str, columns: &[(&str, &str)], rows: Vec<Vec<SqlValue>>) {
        let columns: Vec<ColumnDescriptor> = columns
            .iter()
            .map(|(n, ty)| ColumnDescriptor::new(Ident::new(*n).unwrap(), map_type_name(ty), *ty))
            .collect();
        let rows = rows
            .into_iter()
            .map(|row| normalize_row(row, &columns))
            .collect();
        self.lock()
            .tables
            .insert(name.to_string(), MockTable { columns, rows });
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.lock().tables.contains_key(name)
    }

    /// Rows of `name` in insertion order.
    pub fn rows(&self, name: &str) -> Vec<Vec<SqlValue>> {
        self.lock()
            .tables
            .get(name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Every statement passed to `execute` or `open_cursor`, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Row counts requested from cursors, in order.
    pub fn fetch_sizes(&self) -> Vec<usize> {
        self.lock().fetch_sizes.clone()
    }

    pub fn cursors_opened(&self) -> usize {
        self.lock().cursors_opened
    }

    /// Cursors opened and not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    /// Fail every statement containing `needle`.
    pub fn fail_on(&self, needle: &str) {
        self.lock().failures.push(Failure {
            needle: needle.to_string(),
            code: None,
        });
    }

    /// Fail every statement containing `needle` with SQLSTATE `code`.
    pub fn fail_with_code(&self, needle: &str, code: &str) {
        self.lock().failures.push(Failure {
            needle: needle.to_string(),
            code: Some(code.to_string()),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, sql: &str) -> Result<()> {
        let mut state = self.lock();
        state.statements.push(sql.to_string());
        if let Some(f) = state.failures.iter().find(|f| sql.contains(&f.needle)) {
            return Err(RowMergeError::Query {
                message: format!("injected failure on '{}'", f.needle),
                statement: sql.to_string(),
                code: f.code.clone(),
            });
        }
        Ok(())
    }

    fn run(&self, sql: &str) -> Result<u64> {
        if let Some(rest) = sql.strip_prefix("DROP TABLE IF EXISTS ") {
            let (name, _) = parse_qualified(rest);
            self.lock().tables.remove(&name);
            return Ok(0);
        }
        if let Some(rest) = sql.strip_prefix("UPDATE ") {
            return self.run_update(rest);
        }
        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            return self.run_insert(rest);
        }
        if let Some(rest) = sql.strip_prefix("SELECT ") {
            if let Some(idx) = rest.find(" INTO ") {
                return self.run_select_into(&rest[..idx], &rest[idx + 6..], sql);
            }
        }
        panic!("MockDatabase cannot interpret: {}", sql);
    }

    fn run_select_into(&self, projection: &str, rest: &str, sql: &str) -> Result<u64> {
        let (into, after) = parse_qualified(rest);
        let from = after
            .strip_prefix(" FROM ")
            .unwrap_or_else(|| panic!("missing FROM: {}", sql));

        let mut state = self.lock();
        if state.tables.contains_key(&into) {
            return Err(RowMergeError::Query {
                message: format!("relation \"{}\" already exists", into),
                statement: sql.to_string(),
                code: Some("42P07".to_string()),
            });
        }

        let table = if from.starts_with("(VALUES ") {
            let columns: Vec<ColumnDescriptor> = split_top_level(projection)
                .iter()
                .map(|item| {
                    let (name, sql_type) = parse_cast_item(item);
                    ColumnDescriptor::new(Ident::new(name).unwrap(), map_type_name(&sql_type), sql_type)
                })
                .collect();
            let rows = parse_values(from)
                .into_iter()
                .map(|row| normalize_row(row, &columns))
                .collect();
            MockTable { columns, rows }
        } else {
            let (source, _) = parse_qualified(from);
            let src = state
                .tables
                .get(&source)
                .unwrap_or_else(|| panic!("no table {}", source))
                .clone();
            let names: Vec<String> = split_top_level(projection)
                .iter()
                .map(|i| last_ident(i))
                .collect();
            project(&src, &names)
        };

        let count = table.rows.len() as u64;
        state.tables.insert(into, table);
        Ok(count)
    }

    fn run_insert(&self, rest: &str) -> Result<u64> {
        let (into, after) = parse_qualified(rest);
        let after = after.trim_start();
        let close = after.find(") SELECT ").expect("column list");
        let names: Vec<String> = split_top_level(&after[1..close])
            .iter()
            .map(|c| last_ident(c))
            .collect();
        let select = &after[close + ") SELECT ".len()..];

        let mut state = self.lock();
        let incoming: Vec<Vec<SqlValue>> = if let Some(idx) = select.find("FROM (VALUES ") {
            parse_values(&select[idx + 5..])
        } else {
            let from = select.find(" FROM ").expect("FROM");
            let (source, tail) = parse_qualified(&select[from + 6..]);
            let src = state.tables.get(&source).expect("source table").clone();
            let mut rows = project(&src, &names).rows;

            if let Some(on) = tail.strip_prefix(" LEFT OUTER JOIN ") {
                let (_, cond) = parse_qualified(on);
                let cond = cond.trim_start().trim_start_matches("ON ");
                let cond = &cond[..cond.find(" WHERE ").expect("WHERE")];
                let keys: Vec<String> = cond
                    .split(" AND ")
                    .map(|c| last_ident(c.split(" = ").next().unwrap_or(c)))
                    .collect();
                let existing = state.tables.get(&into).expect("target").clone();
                rows.retain(|row| {
                    !existing.rows.iter().any(|e| {
                        keys.iter().all(|k| {
                            let s = &row[names.iter().position(|n| n == k).unwrap()];
                            let t = &e[existing.position(k).unwrap()];
                            !s.is_null() && s == t
                        })
                    })
                });
            }
            rows
        };

        let table = state
            .tables
            .get_mut(&into)
            .unwrap_or_else(|| panic!("no table {}", into));
        let count = incoming.len() as u64;
        for values in incoming {
            let mut row = vec![SqlValue::Null; table.columns.len()];
            for (name, value) in names.iter().zip(values) {
                let idx = table.position(name).expect("column");
                row[idx] = normalize(value, &table.columns[idx].column_type);
            }
            table.rows.push(row);
        }
        Ok(count)
    }

    fn run_update(&self, rest: &str) -> Result<u64> {
        let (target, after) = parse_qualified(rest);
        let after = after.strip_prefix(" SET ").expect("SET");
        let from = after.find(" FROM ").expect("FROM");
        let set_columns: Vec<String> = split_top_level(&after[..from])
            .iter()
            .map(|a| first_ident(a))
            .collect();
        let (source, tail) = parse_qualified(&after[from + 6..]);
        let tail = tail.strip_prefix(" WHERE ").expect("WHERE");
        let join_part = &tail[..tail.find(" AND (").expect("change predicate")];
        let keys: Vec<String> = join_part
            .split(" AND ")
            .map(|c| last_ident(c.split(" = ").next().unwrap_or(c)))
            .collect();

        let mut state = self.lock();
        let src = state.tables.get(&source).expect("source").clone();
        let table = state.tables.get_mut(&target).expect("target");
        let columns = table.columns.clone();

        let mut updated = 0;
        for row in table.rows.iter_mut() {
            let matching = src.rows.iter().find(|s| {
                keys.iter().all(|k| {
                    let sv = &s[src.position(k).unwrap()];
                    !sv.is_null() && *sv == row[table_position(&columns, k)]
                })
            });
            let Some(s) = matching else { continue };
            let changed = set_columns.iter().any(|c| {
                s[src.position(c).unwrap()] != row[table_position(&columns, c)]
            });
            if changed {
                for c in &set_columns {
                    let idx = table_position(&columns, c);
                    row[idx] = normalize(s[src.position(c).unwrap()].clone(), &columns[idx].column_type);
                }
                updated += 1;
            }
        }
        Ok(updated)
    }
}

fn table_position(columns: &[ColumnDescriptor], name: &str) -> usize {
    columns.iter().position(|c| c.name.as_str() == name).unwrap()
}

fn project(table: &MockTable, names: &[String]) -> MockTable {
    let idx: Vec<usize> = names.iter().map(|n| table.position(n).unwrap()).collect();
    MockTable {
        columns: idx.iter().map(|&i| table.columns[i].clone()).collect(),
        rows: table
            .rows
            .iter()
            .map(|r| idx.iter().map(|&i| r[i].clone()).collect())
            .collect(),
    }
}

#[async_trait]
impl Catalog for MockDatabase {
    async fn describe_table(&self, table: &TableName) -> Result<Option<TableDescriptor>> {
        Ok(self
            .lock()
            .tables
            .get(&table.display_name())
            .map(|t| TableDescriptor::new(table.clone(), t.columns.clone())))
    }

    async fn row_count(&self, table: &TableName) -> Result<i64> {
        let state = self.lock();
        state
            .tables
            .get(&table.display_name())
            .map(|t| t.rows.len() as i64)
            .ok_or_else(|| RowMergeError::NoSuchTable(table.display_name()))
    }
}

#[async_trait]
impl Session for MockDatabase {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.record(sql)?;
        self.run(sql)
    }

    async fn open_cursor(&self, select: &str) -> Result<Box<dyn RowCursor>> {
        self.record(select)?;
        let rest = select.strip_prefix("SELECT ").expect("cursor SELECT");
        let from = rest.rfind(" FROM ").expect("FROM");
        let (name, _) = parse_qualified(&rest[from + 6..]);

        let mut state = self.lock();
        let table = state
            .tables
            .get(&name)
            .ok_or_else(|| RowMergeError::NoSuchTable(name.clone()))?
            .clone();

        let items = split_top_level(&rest[..from]);
        let names: Vec<String> = items.iter().map(|i| last_ident(i)).collect();
        let as_text: Vec<bool> = items.iter().map(|i| i.contains("::text")).collect();
        let projected = project(&table, &names);
        let rows = projected
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&as_text)
                    .map(|(v, text)| match (*text, v) {
                        (true, SqlValue::Null) => SqlValue::Null,
                        (true, v) => SqlValue::Text(v.to_string()),
                        (false, v) => v,
                    })
                    .collect()
            })
            .collect();

        state.cursors_opened += 1;
        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCursor {
            columns: Arc::from(names),
            rows,
            db: self.clone(),
            closed: false,
        }))
    }
}

struct MockCursor {
    columns: Arc<[String]>,
    rows: VecDeque<Vec<SqlValue>>,
    db: MockDatabase,
    closed: bool,
}

#[async_trait]
impl RowCursor for MockCursor {
    async fn fetch(&mut self, max_rows: usize) -> Result<Batch> {
        assert!(!self.closed, "fetch on closed cursor");
        self.db.lock().fetch_sizes.push(max_rows);
        let take = max_rows.min(self.rows.len());
        let rows = self
            .rows
            .drain(..take)
            .map(|values| Row::new(self.columns.clone(), values))
            .collect::<Result<Vec<_>>>()?;
        let is_last = rows.len() < max_rows;
        Ok(Batch::new(rows, is_last))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.db.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MockCursor {
    fn drop(&mut self) {
        if !self.closed {
            self.db.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ===== value normalisation =====

fn normalize_row(row: Vec<SqlValue>, columns: &[ColumnDescriptor]) -> Vec<SqlValue> {
    row.into_iter()
        .zip(columns)
        .map(|(v, c)| normalize(v, &c.column_type))
        .collect()
}

fn normalize(value: SqlValue, ty: &ColumnType) -> SqlValue {
    if value.is_null() {
        return value;
    }
    match ty {
        ColumnType::Integer | ColumnType::BigInteger => match &value {
            SqlValue::Text(s) => s.parse().map(SqlValue::I64).unwrap_or(value),
            SqlValue::F64(f) if f.fract() == 0.0 => SqlValue::I64(*f as i64),
            v => v.as_i64().map(SqlValue::I64).unwrap_or(value),
        },
        ColumnType::Float | ColumnType::Numeric => match &value {
            SqlValue::Text(s) => s.parse().map(SqlValue::F64).unwrap_or(value),
            v => v.as_f64().map(SqlValue::F64).unwrap_or(value),
        },
        ColumnType::Boolean => match &value {
            SqlValue::Bool(_) => value,
            v => v.as_i64().map(|i| SqlValue::Bool(i != 0)).unwrap_or(value),
        },
        ColumnType::Date => match &value {
            SqlValue::Text(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(SqlValue::Date)
                .unwrap_or(value),
            _ => value,
        },
        ColumnType::DateTime => match &value {
            SqlValue::Text(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .map(SqlValue::DateTime)
                .unwrap_or(value),
            _ => value,
        },
        ColumnType::Json | ColumnType::Jsonb => match &value {
            SqlValue::Text(s) => serde_json::from_str(s).map(SqlValue::Json).unwrap_or(value),
            _ => value,
        },
        ColumnType::Text | ColumnType::Geometry | ColumnType::Unmapped(_) => match value {
            SqlValue::Text(_) => value,
            SqlValue::Json(v) => SqlValue::Text(v.to_string()),
            other => SqlValue::Text(other.to_string()),
        },
        ColumnType::LargeBinary => value,
    }
}

// ===== statement parsing =====

/// Parse a leading `"ident"`, returning the name and the remaining text.
fn parse_ident(s: &str) -> (String, &str) {
    let s = s.trim_start();
    assert!(s.starts_with('"'), "expected identifier at: {}", s);
    let mut out = String::new();
    let mut i = 1;
    loop {
        let j = i + s[i..].find('"').expect("closing quote");
        out.push_str(&s[i..j]);
        if s[j + 1..].starts_with('"') {
            out.push('"');
            i = j + 2;
        } else {
            return (out, &s[j + 1..]);
        }
    }
}

/// Parse `"schema"."table"`, returning `schema.table` and the remaining text.
fn parse_qualified(s: &str) -> (String, &str) {
    let (schema, rest) = parse_ident(s);
    let rest = rest.strip_prefix('.').expect("qualified name");
    let (name, rest) = parse_ident(rest);
    (format!("{}.{}", schema, name), rest)
}

fn first_ident(s: &str) -> String {
    parse_ident(s).0
}

/// The last quoted identifier in `s`.
fn last_ident(s: &str) -> String {
    let s = s.trim();
    let end = s.rfind('"').expect("identifier");
    let mut start = end;
    loop {
        let open = s[..start].rfind('"').expect("opening quote");
        if open > 0 && s.as_bytes()[open - 1] == b'"' {
            start = open - 1;
        } else {
            return s[open + 1..end].replace("\"\"", "\"");
        }
    }
}

/// `"values"."c"::numeric(10,2) AS "c"` into (`c`, `numeric(10,2)`).
fn parse_cast_item(item: &str) -> (String, String) {
    let cast = item.find("::").expect("cast");
    let alias = item.rfind(" AS ").expect("alias");
    (last_ident(&item[alias..]), item[cast + 2..alias].to_string())
}

/// Split at commas outside quotes and parentheses.
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_ident = false;
    let mut in_string = false;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '"' if !in_string => in_ident = !in_ident,
            '\'' if !in_ident => in_string = !in_string,
            '(' if !in_ident && !in_string => depth += 1,
            ')' if !in_ident && !in_string => depth -= 1,
            ',' if depth == 0 && !in_ident && !in_string => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Parse the tuples of `(VALUES (..), (..)) AS ...`.
fn parse_values(s: &str) -> Vec<Vec<SqlValue>> {
    let mut rest = s.strip_prefix("(VALUES ").expect("VALUES");
    let mut rows = Vec::new();
    loop {
        rest = rest.trim_start().strip_prefix('(').expect("tuple");
        let mut row = Vec::new();
        loop {
            let (value, after) = parse_literal(rest.trim_start());
            row.push(value);
            let after = after.trim_start();
            if let Some(next) = after.strip_prefix(',') {
                rest = next;
            } else {
                rest = after.strip_prefix(')').expect("end of tuple");
                break;
            }
        }
        rows.push(row);
        let after = rest.trim_start();
        if let Some(next) = after.strip_prefix(',') {
            rest = next;
        } else {
            assert!(after.starts_with(')'), "end of VALUES");
            return rows;
        }
    }
}

fn parse_literal(s: &str) -> (SqlValue, &str) {
    if let Some(rest) = s.strip_prefix("NULL") {
        return (SqlValue::Null, rest);
    }
    if let Some(rest) = s.strip_prefix("true") {
        return (SqlValue::Bool(true), rest);
    }
    if let Some(rest) = s.strip_prefix("false") {
        return (SqlValue::Bool(false), rest);
    }
    if s.starts_with('\'') {
        let mut text = String::new();
        let mut i = 1;
        let rest = loop {
            let j = i + s[i..].find('\'').expect("closing quote");
            text.push_str(&s[i..j]);
            if s[j + 1..].starts_with('\'') {
                text.push('\'');
                i = j + 2;
            } else {
                break &s[j + 1..];
            }
        };
        let (cast, rest) = match rest.strip_prefix("::") {
            Some(r) => {
                let end = r.find(|c: char| c == ',' || c == ')').unwrap_or(r.len());
                (Some(r[..end].trim()), &r[end..])
            }
            None => (None, rest),
        };
        let value = match cast {
            Some("date") => SqlValue::Date(NaiveDate::parse_from_str(&text, "%Y-%m-%d").unwrap()),
            Some("timestamp") => SqlValue::DateTime(
                NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f").unwrap(),
            ),
            Some("json") | Some("jsonb") => SqlValue::Json(serde_json::from_str(&text).unwrap()),
            Some("bytea") => SqlValue::Bytes(
                hex::decode(text.strip_prefix("\\x").unwrap_or(&text)).unwrap(),
            ),
            _ => SqlValue::Text(text),
        };
        return (value, rest);
    }
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E')))
        .unwrap_or(s.len());
    let token = &s[..end];
    let value = if token.contains(['.', 'e', 'E']) {
        SqlValue::F64(token.parse().unwrap())
    } else {
        SqlValue::I64(token.parse().unwrap())
    };
    (value, &s[end..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values_tuples() {
        let rows = parse_values(
            r#"(VALUES (1, 'it''s', NULL, '{"a":1}'::jsonb), (2.5, 'x, y', true, '2024-01-02'::date)) AS "values" ("a", "b", "c", "d")"#,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], SqlValue::Text("it's".into()));
        assert_eq!(rows[0][3], SqlValue::Json(serde_json::json!({"a": 1})));
        assert_eq!(rows[1][0], SqlValue::F64(2.5));
        assert_eq!(rows[1][1], SqlValue::Text("x, y".into()));
        assert_eq!(
            rows[1][3],
            SqlValue::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
        );
    }

    #[test]
    fn test_identifier_helpers() {
        assert_eq!(last_ident(r#""public"."orders"."pk""#), "pk");
        assert_eq!(last_ident(r#""a""b""#), "a\"b");
        assert_eq!(
            parse_qualified(r#""s"."t" rest"#),
            ("s.t".to_string(), " rest")
        );
        assert_eq!(
            split_top_level(r#""a"::numeric(10,2) AS "a", "b""#),
            vec![r#""a"::numeric(10,2) AS "a""#, r#""b""#]
        );
    }
}
