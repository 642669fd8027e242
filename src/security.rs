//! SQL injection prevention utilities.
//!
//! Object names (schemas, tables, columns, constraints) are the only
//! user-supplied text this crate splices into SQL; row data is always bound
//! as typed TDS parameters (see [`crate::client`]). Names are validated
//! against SQL Server's `sysname` rules here and bracket-quoted at every
//! emission site.

use crate::error::Error;

/// Validate a SQL Server object name (schema, table, column, constraint).
///
/// The domain is `sysname`: at most 128 characters (characters, not bytes;
/// the type is `nvarchar(128)`). Characters follow the regular-identifier
/// rules, with two adjustments for real-world schemas:
///
/// - letters are Unicode, as SQL Server's ISO identifier rules allow
///   (`Región` is a legitimate table name)
/// - embedded spaces are tolerated because production databases carry
///   names like `Order Details`, and every name this crate emits is
///   bracket-quoted
///
/// `#` and `$` are accepted past the first character; a leading `#` names
/// a temp object and a leading `@` a variable, neither of which can be a
/// replicated table. Everything else (brackets, quotes, punctuation,
/// control characters) is rejected so a name can never terminate its own
/// bracket or literal context downstream.
///
/// # Examples
///
/// ```
/// use tablesync::security::validate_identifier;
///
/// assert!(validate_identifier("Sucursal").is_ok());
/// assert!(validate_identifier("Order Details").is_ok());
/// assert!(validate_identifier("Región").is_ok());
///
/// assert!(validate_identifier("#TempImport").is_err());
/// assert!(validate_identifier("Name]; DELETE FROM Ledger").is_err());
/// ```
pub fn validate_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL Server object name is empty"));
    }

    if name.chars().count() > 128 {
        return Err(Error::config(format!(
            "SQL Server object name '{}' exceeds sysname's 128 characters",
            name.escape_debug()
        )));
    }

    for (position, c) in name.chars().enumerate() {
        let allowed = if c.is_alphabetic() || c == '_' {
            true
        } else {
            position > 0 && (c.is_ascii_digit() || c == '$' || c == '#' || c == ' ')
        };
        if !allowed {
            return Err(Error::config(format!(
                "'{}' is not a valid SQL Server object name: character '{}' at position {}",
                name.escape_debug(),
                c.escape_debug(),
                position
            )));
        }
    }

    Ok(())
}

/// Quote an object name with square brackets, doubling any closing bracket.
///
/// This is the only quoting form the crate emits; SQL Server accepts it for
/// every object class touched here.
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Double single quotes for interpolation into an `N'...'` literal.
///
/// Only the ledger bootstrap script needs this (its `IF NOT EXISTS` probe
/// must be a complete SQL string); everything else binds typed parameters.
pub fn escape_string_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_production_object_names() {
        assert!(validate_identifier("Sucursal").is_ok());
        assert!(validate_identifier("SyncMetadata").is_ok());
        assert!(validate_identifier("Order Details").is_ok());
        assert!(validate_identifier("_staging").is_ok());
        assert!(validate_identifier("Ventas$2024").is_ok());
        assert!(validate_identifier("Import#Batch").is_ok());
    }

    #[test]
    fn test_accepts_unicode_letters() {
        // SQL Server regular identifiers take Unicode letters
        assert!(validate_identifier("Región").is_ok());
        assert!(validate_identifier("Almacén_Depósito").is_ok());
    }

    #[test]
    fn test_rejects_temp_and_variable_prefixes() {
        assert!(validate_identifier("#TempImport").is_err());
        assert!(validate_identifier("@BatchSize").is_err());
        assert!(validate_identifier("@@ROWCOUNT").is_err());
    }

    #[test]
    fn test_rejects_leading_digit_or_space() {
        assert!(validate_identifier("2024Sales").is_err());
        assert!(validate_identifier(" Customer").is_err());
        assert!(validate_identifier("$Total").is_err());
    }

    #[test]
    fn test_rejects_bracket_and_literal_escapes() {
        // Anything that could close a bracket or a string literal downstream
        assert!(validate_identifier("Name]; DELETE FROM Ledger").is_err());
        assert!(validate_identifier("Orders[0]").is_err());
        assert!(validate_identifier("O'Brien").is_err());
        assert!(validate_identifier("col\"quoted").is_err());
        assert!(validate_identifier("dbo.Customer").is_err());
        assert!(validate_identifier("a;b").is_err());
        assert!(validate_identifier("a--comment").is_err());
    }

    #[test]
    fn test_rejects_control_characters() {
        assert!(validate_identifier("line\nbreak").is_err());
        assert!(validate_identifier("tab\tstop").is_err());
        assert!(validate_identifier("nul\0byte").is_err());
    }

    #[test]
    fn test_sysname_limit_counts_characters() {
        let at_limit: String = "a".repeat(128);
        assert!(validate_identifier(&at_limit).is_ok());

        let over: String = "a".repeat(129);
        assert!(validate_identifier(&over).is_err());

        // 128 two-byte characters still fit: the limit is nvarchar(128),
        // not a byte count
        let wide: String = "é".repeat(128);
        assert!(validate_identifier(&wide).is_ok());
    }

    #[test]
    fn test_rejects_empty_name() {
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_quote_identifier_doubles_closing_bracket() {
        assert_eq!(quote_identifier("Customer"), "[Customer]");
        assert_eq!(quote_identifier("odd]name"), "[odd]]name]");
        assert_eq!(quote_identifier("Order Details"), "[Order Details]");
    }

    #[test]
    fn test_escape_string_literal_doubles_quotes() {
        assert_eq!(escape_string_literal("dbo"), "dbo");
        assert_eq!(escape_string_literal("O'Brien"), "O''Brien");
        assert_eq!(
            escape_string_literal("'; DELETE FROM Ledger --"),
            "''; DELETE FROM Ledger --"
        );
    }
}
