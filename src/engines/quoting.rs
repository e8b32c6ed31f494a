//! Identifier and literal escaping for administrative statements.
//!
//! `CREATE USER`, `ALTER USER` and friends cannot take bind parameters, so
//! every identifier and password that lands in one goes through here.

/// Input that cannot be safely embedded in a statement
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot quote {value:?}: {reason}")]
pub struct QuoteError {
    pub value: String,
    pub reason: &'static str,
}

fn reject(value: &str, reason: &'static str) -> QuoteError {
    QuoteError {
        value: value.to_string(),
        reason,
    }
}

fn check_common(value: &str) -> Result<(), QuoteError> {
    if value.is_empty() {
        return Err(reject(value, "empty"));
    }
    if value.contains('\0') {
        return Err(reject(value, "contains NUL"));
    }
    Ok(())
}

/// PostgreSQL identifier: `"name"`, embedded quotes doubled
pub fn pg_identifier(ident: &str) -> Result<String, QuoteError> {
    check_common(ident)?;
    // NAMEDATALEN - 1
    if ident.len() > 63 {
        return Err(reject(ident, "longer than 63 bytes"));
    }
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

/// PostgreSQL string literal. Uses the `E''` form when backslashes are
/// present so the result does not depend on `standard_conforming_strings`.
pub fn pg_literal(value: &str) -> Result<String, QuoteError> {
    check_common(value)?;
    let doubled = value.replace('\'', "''");
    if value.contains('\\') {
        Ok(format!("E'{}'", doubled.replace('\\', "\\\\")))
    } else {
        Ok(format!("'{}'", doubled))
    }
}

/// MySQL identifier: `` `name` ``, embedded backticks doubled
pub fn mysql_identifier(ident: &str) -> Result<String, QuoteError> {
    check_common(ident)?;
    if ident.len() > 64 {
        return Err(reject(ident, "longer than 64 characters"));
    }
    Ok(format!("`{}`", ident.replace('`', "``")))
}

/// MySQL string literal with quotes doubled. Backslashes are rejected so
/// the result reads the same with or without `NO_BACKSLASH_ESCAPES`.
pub fn mysql_literal(value: &str) -> Result<String, QuoteError> {
    check_common(value)?;
    if value.contains('\\') {
        return Err(reject(value, "contains a backslash"));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

/// MySQL account name `'user'@'%'`
pub fn mysql_account(user: &str) -> Result<String, QuoteError> {
    if user.len() > 32 {
        return Err(reject(user, "longer than 32 characters"));
    }
    Ok(format!("{}@'%'", mysql_literal(user)?))
}
