// SQL fragment helpers: identifier checks and `$n` placeholder scanning/renumbering

use crate::errors::DatabaseError;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use std::ops::Range;

lazy_static! {
    static ref IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("identifier pattern is valid");
}

/// Accept a bare or schema-qualified identifier; anything else could smuggle SQL
pub fn validate_identifier(name: &str) -> Result<(), DatabaseError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(DatabaseError::validation(
            name,
            "not a valid SQL identifier (expected [A-Za-z_][A-Za-z0-9_]*, optionally dot-qualified)",
        ))
    }
}

/// Positions and numbers of every `$n` placeholder outside quoted text
pub fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    // A doubled quote is an escaped quote, not the end
                    if bytes.get(i + 1) == Some(&q) {
                        i += 1;
                    } else {
                        quote = None;
                    }
                }
            }
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let preceded_by_word = i > 0
                    && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_');
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .count();
                if digits > 0 && !preceded_by_word {
                    let end = i + 1 + digits;
                    if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                        found.push((i..end, n));
                    }
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Check that a fragment uses exactly `$1..$arg_count`, each at least once
pub fn check_placeholders(sql: &str, arg_count: usize) -> Result<(), DatabaseError> {
    let used: BTreeSet<usize> = placeholders(sql).into_iter().map(|(_, n)| n).collect();
    let expected: BTreeSet<usize> = (1..=arg_count).collect();
    if used == expected {
        Ok(())
    } else {
        Err(DatabaseError::query(
            sql,
            format!(
                "fragment uses placeholders {:?} but {} argument(s) were supplied",
                used, arg_count
            ),
        ))
    }
}

/// Shift every placeholder in `sql` up by `offset` (`$1` becomes `$(1 + offset)`)
pub fn renumber(sql: &str, offset: usize) -> String {
    if offset == 0 {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 4);
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[last..range.start]);
        out.push('$');
        out.push_str(&(n + offset).to_string());
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("_tmp1").is_ok());
        assert!(validate_identifier("audit.events").is_ok());
        assert!(validate_identifier("1users").is_err());
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_placeholders_skip_quoted_text() {
        let sql = "name = $1 AND note <> 'costs $2' AND \"col$3\" = $2";
        let numbers: Vec<usize> = placeholders(sql).into_iter().map(|(_, n)| n).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_escaped_quote_does_not_end_literal() {
        let sql = "a = 'it''s $1' AND b = $1";
        assert_eq!(placeholders(sql).len(), 1);
    }

    #[test]
    fn test_check_placeholders() {
        assert!(check_placeholders("a = $1 AND b = $2", 2).is_ok());
        assert!(check_placeholders("a = $1 OR a2 = $1", 1).is_ok());
        assert!(check_placeholders("a IS NULL", 0).is_ok());
        assert!(check_placeholders("a = $1", 2).is_err());
        assert!(check_placeholders("a = $2", 1).is_err());
        assert!(check_placeholders("a = $1 AND b = $3", 2).is_err());
    }

    #[test]
    fn test_renumber() {
        assert_eq!(renumber("a = $1 AND b = $2", 3), "a = $4 AND b = $5");
        assert_eq!(renumber("a = $10", 1), "a = $11");
        assert_eq!(renumber("x = 'lit $1' AND y = $1", 2), "x = 'lit $1' AND y = $3");
        assert_eq!(renumber("price$1 = $1", 1), "price$1 = $2");
    }
}
