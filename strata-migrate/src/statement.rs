//! Rendered, dialect-specific SQL.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::ObjectRef;

/// A single SQL statement ready to hand to a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// SQL text without a trailing delimiter.
    pub sql: String,
    /// Delimiter appended when writing scripts.
    pub delimiter: String,
    /// Schema objects the statement touches.
    pub affected: Vec<ObjectRef>,
}

impl Statement {
    /// Create a statement with the default `;` delimiter.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            delimiter: ";".to_string(),
            affected: Vec::new(),
        }
    }

    /// Set the delimiter used when the statement is written to a script.
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Record affected objects.
    pub fn affecting(mut self, objects: impl IntoIterator<Item = ObjectRef>) -> Self {
        self.affected.extend(objects);
        self
    }

    /// Script form: SQL followed by its delimiter.
    pub fn to_script(&self) -> String {
        if self.delimiter == "GO" || self.delimiter == "/" {
            format!("{}\n{}", self.sql, self.delimiter)
        } else {
            format!("{}{}", self.sql, self.delimiter)
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Split a raw SQL script on top-level `;`, ignoring delimiters inside
/// quoted strings, quoted identifiers and `--` line comments.
pub fn split_sql(script: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            current.push('\n');
                            break;
                        }
                    }
                }
                ';' => {
                    let trimmed = current.trim();
                    if !trimmed.is_empty() {
                        out.push(trimmed.to_string());
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    out
}
