//! Connection identity models.
//!
//! A [`ConnectionIdentity`] names one database on one server. Identities are
//! cheap to clone and compare by their normalized key.

use crate::config::ConnectionSettings;
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

/// Default schema used when qualifying object names.
pub const DEFAULT_SCHEMA: &str = "dbo";

#[derive(Debug)]
struct IdentityInner {
    server_name: String,
    database_name: String,
    key: String,
    settings: ConnectionSettings,
}

/// Immutable (server, database) pair.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    inner: Arc<IdentityInner>,
}

impl ConnectionIdentity {
    /// Create an identity. Both names are required.
    pub fn new(
        server_name: impl Into<String>,
        database_name: impl Into<String>,
        settings: ConnectionSettings,
    ) -> DbResult<Self> {
        let server_name = server_name.into().trim().to_string();
        let database_name = database_name.into().trim().to_string();
        if server_name.is_empty() {
            return Err(DbError::configuration("Server name cannot be empty"));
        }
        if database_name.is_empty() {
            return Err(DbError::configuration(format!(
                "Database name cannot be empty (server '{}')",
                server_name
            )));
        }
        let key = identity_key(&server_name, &database_name);
        Ok(Self {
            inner: Arc::new(IdentityInner {
                server_name,
                database_name,
                key,
                settings,
            }),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    pub fn database_name(&self) -> &str {
        &self.inner.database_name
    }

    /// Normalized lower-case `server.database` key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    /// Human-readable name used in logs and error messages.
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.inner.server_name, self.inner.database_name)
    }

    pub fn connection_string(&self) -> String {
        self.inner
            .settings
            .connection_string(&self.inner.server_name, &self.inner.database_name)
    }

    pub fn masked_connection_string(&self) -> String {
        self.inner
            .settings
            .masked_connection_string(&self.inner.server_name, &self.inner.database_name)
    }

    pub fn is_same_database(&self, other: &ConnectionIdentity) -> bool {
        self.key() == other.key()
    }

    pub fn is_same_server(&self, other: &ConnectionIdentity) -> bool {
        self.server_name().eq_ignore_ascii_case(other.server_name())
    }

    /// `[database]` with brackets escaped.
    pub fn quoted_database(&self) -> String {
        quote_name(&self.inner.database_name)
    }

    /// `USE [database]` statement that re-targets a shared connection.
    pub fn use_statement(&self) -> String {
        format!("USE {};", self.quoted_database())
    }
}

impl PartialEq for ConnectionIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.is_same_database(other)
    }
}

impl Eq for ConnectionIdentity {}

impl Hash for ConnectionIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

fn identity_key(server: &str, database: &str) -> String {
    format!("{}.{}", server, database).to_lowercase()
}

/// Bracket-quote an identifier, escaping closing brackets.
pub fn quote_name(name: &str) -> String {
    let trimmed = name.trim();
    let unquoted = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .map(|s| s.replace("]]", "]"))
        .unwrap_or_else(|| trimmed.to_string());
    format!("[{}]", unquoted.replace(']', "]]"))
}

/// Strip brackets from a possibly-quoted identifier.
pub fn unquote_name(name: &str) -> String {
    let trimmed = name.trim();
    trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .map(|s| s.replace("]]", "]"))
        .unwrap_or_else(|| trimmed.to_string())
}

/// Qualify `object` or `schema.object` as `[schema].[object]`.
pub fn qualify_object_name(object: &str) -> String {
    let (schema, name) = split_object_name(object);
    format!("{}.{}", quote_name(&schema), quote_name(&name))
}

/// Split `schema.object` into its parts, defaulting the schema to `dbo`.
pub fn split_object_name(object: &str) -> (String, String) {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    for ch in object.trim().chars() {
        match ch {
            '[' if !in_brackets => {
                in_brackets = true;
                current.push(ch);
            }
            ']' if in_brackets => {
                in_brackets = false;
                current.push(ch);
            }
            '.' if !in_brackets => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);
    let name = parts.pop().map(|p| unquote_name(&p)).unwrap_or_default();
    let schema = parts
        .pop()
        .map(|p| unquote_name(&p))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
    (schema, name)
}

/// Escape a value for use inside an `N'...'` literal.
pub fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// Cache of identities, one per (server, database) pair.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    settings: ConnectionSettings,
    identities: Arc<RwLock<HashMap<String, ConnectionIdentity>>>,
}

impl ConnectionRegistry {
    /// Create a new registry whose identities share `settings`.
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            identities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get or create the identity for a (server, database) pair.
    pub fn identity(&self, server: &str, database: &str) -> DbResult<ConnectionIdentity> {
        let key = identity_key(server.trim(), database.trim());
        {
            let identities = self
                .identities
                .read()
                .map_err(|_| DbError::internal("identity registry lock poisoned"))?;
            if let Some(identity) = identities.get(&key) {
                return Ok(identity.clone());
            }
        }

        let identity = ConnectionIdentity::new(server, database, self.settings.clone())?;
        let mut identities = self
            .identities
            .write()
            .map_err(|_| DbError::internal("identity registry lock poisoned"))?;
        // Another caller may have won the race; keep the first instance.
        Ok(identities
            .entry(key)
            .or_insert(identity)
            .clone())
    }

    /// Number of distinct identities created so far.
    pub fn len(&self) -> usize {
        self.identities.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(server: &str, db: &str) -> ConnectionIdentity {
        ConnectionIdentity::new(server, db, ConnectionSettings::default()).unwrap()
    }

    #[test]
    fn test_key_is_lower_case() {
        let id = identity("SQL01", "Models");
        assert_eq!(id.key(), "sql01.models");
        assert_eq!(id.display_name(), "SQL01.Models");
    }

    #[test]
    fn test_same_database_and_same_server() {
        let a = identity("SQL01", "Models");
        let b = identity("sql01", "MODELS");
        let c = identity("sql01", "Blobs");
        let d = identity("sql02", "Models");
        assert!(a.is_same_database(&b));
        assert_eq!(a, b);
        assert!(a.is_same_server(&c));
        assert!(!a.is_same_database(&c));
        assert!(!a.is_same_server(&d));
    }

    #[test]
    fn test_empty_names_are_rejected() {
        assert!(ConnectionIdentity::new("", "db", ConnectionSettings::default()).is_err());
        assert!(ConnectionIdentity::new("srv", "  ", ConnectionSettings::default()).is_err());
    }

    #[test]
    fn test_qualified_names() {
        let id = identity("sql01", "Models");
        assert_eq!(id.use_statement(), "USE [Models];");
        assert_eq!(qualify_object_name("Files"), "[dbo].[Files]");
        assert_eq!(qualify_object_name("audit.[Log]"), "[audit].[Log]");
    }

    #[test]
    fn test_masked_connection_string() {
        let settings = ConnectionSettings {
            user: Some("app".to_string()),
            password: Some("secret".to_string()),
            ..ConnectionSettings::default()
        };
        let id = ConnectionIdentity::new("sql01", "Models", settings).unwrap();
        let masked = id.masked_connection_string();
        assert!(masked.contains("Password=****"));
        assert!(!masked.contains("secret"));
    }

    #[test]
    fn test_quote_name_escapes_brackets() {
        assert_eq!(quote_name("a]b"), "[a]]b]");
        assert_eq!(quote_name("[already]"), "[already]");
        assert_eq!(unquote_name("[a]]b]"), "a]b");
    }

    #[test]
    fn test_split_object_name_handles_dots_in_brackets() {
        assert_eq!(
            split_object_name("[my.schema].[t.1]"),
            ("my.schema".to_string(), "t.1".to_string())
        );
        assert_eq!(
            split_object_name("Files"),
            ("dbo".to_string(), "Files".to_string())
        );
    }

    #[test]
    fn test_registry_caches_per_pair() {
        let registry = ConnectionRegistry::new(ConnectionSettings::default());
        let a = registry.identity("sql01", "Models").unwrap();
        let b = registry.identity("SQL01", "models").unwrap();
        let _c = registry.identity("sql01", "Blobs").unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(registry.len(), 2);
    }
}
