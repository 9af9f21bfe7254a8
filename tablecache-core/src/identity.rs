//! Identity types for cached objects, scopes and storage connections

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Primary identifier of a persisted row. Positive and immutable once assigned.
pub type ObjectId = i64;

/// Value of a table's write counter. Every save of a row stamps it with the
/// next serial of its table.
pub type Serial = i64;

/// The partition a "select all" query is relative to (tenant, dataset,
/// time window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeKey(Uuid);

impl ScopeKey {
    /// Wrap an existing scope identifier.
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// The scope used by callers that do not partition their data.
    pub fn global() -> Self {
        Self(Uuid::nil())
    }

    /// Generate a fresh scope (timestamp-sortable UUIDv7).
    pub fn now_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_global(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ScopeKey {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            f.write_str("global")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Names one physical storage connection.
///
/// Cached objects and lists remember the connection they were loaded
/// through so that everything tied to a closed connection can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn now_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptor of the storage session a cache call runs on.
///
/// The store implementation maps `connection` back to its real connection;
/// the cache only needs the identity and whether a multi-statement
/// transaction is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session {
    pub connection: ConnectionId,
    pub in_transaction: bool,
}

impl Session {
    /// A session outside of any transaction.
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            in_transaction: false,
        }
    }

    /// Same connection, inside a multi-statement transaction.
    pub fn in_transaction(mut self) -> Self {
        self.in_transaction = true;
        self
    }

    /// Same connection, transaction committed or rolled back.
    pub fn autocommit(mut self) -> Self {
        self.in_transaction = false;
        self
    }
}

/// Names the domain type a cache holds. One cache exists per descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Domain type name, unique within a registry.
    pub name: String,
    /// Table the rows live in.
    pub table: String,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.table)
    }
}

/// One row of a changed-serials scan: the row `id` was last written with
/// `serial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SerialChange {
    pub id: ObjectId,
    pub serial: Serial,
}

impl SerialChange {
    pub fn new(id: ObjectId, serial: Serial) -> Self {
        Self { id, serial }
    }
}

impl From<(ObjectId, Serial)> for SerialChange {
    fn from((id, serial): (ObjectId, Serial)) -> Self {
        Self { id, serial }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_scope_is_nil() {
        let scope = ScopeKey::global();
        assert!(scope.is_global());
        assert_eq!(scope, ScopeKey::default());
        assert_eq!(scope.to_string(), "global");
    }

    #[test]
    fn test_generated_scopes_differ() {
        let a = ScopeKey::now_v7();
        let b = ScopeKey::now_v7();
        assert_ne!(a, b);
        assert!(!a.is_global());
    }

    #[test]
    fn test_session_transaction_toggle() {
        let session = Session::new(ConnectionId::now_v7());
        assert!(!session.in_transaction);

        let tx = session.in_transaction();
        assert!(tx.in_transaction);
        assert_eq!(tx.connection, session.connection);
        assert!(!tx.autocommit().in_transaction);
    }

    #[test]
    fn test_serial_change_from_tuple() {
        let change = SerialChange::from((3, 6));
        assert_eq!(change, SerialChange::new(3, 6));
    }
}
