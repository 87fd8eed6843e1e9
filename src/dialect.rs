//! SQL Dialect
//!
//! The narrow slice of vendor knowledge the cluster needs: which statements
//! are structural, which are read-only, and which serialize on a named
//! object.

/// Statement classification supplied by a vendor dialect
pub trait Dialect: Send + Sync {
    /// Schema-changing statement requiring the cluster-wide exclusive lock
    fn is_structural(&self, sql: &str) -> bool;

    /// Statement that does not change member state
    fn is_read_only(&self, sql: &str) -> bool;

    /// Named object the statement must serialize on, if any
    fn lock_name(&self, _sql: &str) -> Option<String> {
        None
    }
}

/// Keyword-based classification shared by MySQL and MariaDB
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDialect;

const STRUCTURAL_PREFIXES: &[&str] = &["CREATE", "ALTER", "DROP", "TRUNCATE", "RENAME"];
const READ_ONLY_PREFIXES: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

impl StandardDialect {
    fn first_keyword(sql: &str) -> String {
        strip_leading_comments(sql)
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase()
    }
}

impl Dialect for StandardDialect {
    fn is_structural(&self, sql: &str) -> bool {
        let keyword = Self::first_keyword(sql);
        STRUCTURAL_PREFIXES.contains(&keyword.as_str())
    }

    fn is_read_only(&self, sql: &str) -> bool {
        let keyword = Self::first_keyword(sql);
        if !READ_ONLY_PREFIXES.contains(&keyword.as_str()) {
            return false;
        }
        // SELECT ... FOR UPDATE and sequence reads mutate member state
        let upper = sql.to_ascii_uppercase();
        !upper.contains("FOR UPDATE") && self.lock_name(sql).is_none()
    }

    /// Sequence access: `NEXTVAL(seq)` or `NEXT VALUE FOR seq`
    fn lock_name(&self, sql: &str) -> Option<String> {
        let upper = sql.to_ascii_uppercase();

        let rest = if let Some(pos) = upper.find("NEXTVAL(") {
            &sql[pos + "NEXTVAL(".len()..]
        } else if let Some(pos) = upper.find("NEXT VALUE FOR ") {
            &sql[pos + "NEXT VALUE FOR ".len()..]
        } else {
            return None;
        };

        let name: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || matches!(*c, '_' | '.' | '`'))
            .filter(|c| *c != '`')
            .collect();

        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(end) => rest = after[end + 2..].trim_start(),
                None => return "",
            }
        } else if rest.starts_with("--") || rest.starts_with('#') {
            match rest.find('\n') {
                Some(end) => rest = rest[end + 1..].trim_start(),
                None => return "",
            }
        } else {
            return rest;
        }
    }
}
