use crate::error::TenantError;

/// Postgres truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const MIN_SLUG_LEN: usize = 2;

/// Physical database name for a tenant slug: lowercased, every run of
/// non-alphanumeric characters collapsed to one `_`, then prefixed.
///
/// `tenant_` + `Acme--Corp` -> `tenant_acme_corp`.
pub fn database_name(prefix: &str, slug: &str) -> String {
    let mut sanitized = String::with_capacity(slug.len());
    let mut in_separator = false;
    for c in slug.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c);
            in_separator = false;
        } else if !in_separator {
            sanitized.push('_');
            in_separator = true;
        }
    }
    format!("{prefix}{sanitized}")
}

/// Longest slug whose database name still fits in a Postgres identifier.
pub fn max_slug_len(prefix: &str) -> usize {
    MAX_IDENTIFIER_LEN.saturating_sub(prefix.len())
}

/// Validates a tenant slug: lowercase ASCII letters, digits and single hyphens,
/// not starting or ending with a hyphen.
///
/// Single hyphens keep `database_name` injective over valid slugs, and the length
/// bound keeps the derived name inside the identifier limit.
pub fn validate_slug(slug: &str, prefix: &str) -> Result<(), TenantError> {
    let max = max_slug_len(prefix);
    if slug.len() < MIN_SLUG_LEN || slug.len() > max {
        return Err(TenantError::InvalidInput(format!(
            "slug must be between {MIN_SLUG_LEN} and {max} characters"
        )));
    }
    let valid = slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--");
    if !valid {
        return Err(TenantError::InvalidInput(
            "slug may only contain lowercase letters, digits and single hyphens".into(),
        ));
    }
    Ok(())
}

/// Double-quotes an identifier for use in `CREATE DATABASE` and friends,
/// which cannot take bind parameters.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
