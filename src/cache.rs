//! Prepared-statement cache, keyed per physical connection.
//!
//! Server statement ids are only meaningful on the connection that prepared
//! them, so entries are keyed by (connection id, SQL text) and a whole
//! connection's entries are dropped together when it goes away.

use crate::codec::ColumnDefinition;
use std::collections::HashMap;

/// Server-side handle and metadata of one prepared statement.
#[derive(Debug, Clone)]
pub(crate) struct CachedStatement {
    /// Server-assigned statement id
    pub statement_id: u32,
    /// Number of `?` placeholders the server counted
    pub num_params: u16,
    /// Declared wire type per parameter, from the prepare response
    pub param_types: Vec<u8>,
    /// Result column metadata, when the statement produces rows
    pub columns: Vec<ColumnDefinition>,
}

#[derive(Debug)]
struct Entry {
    stmt: CachedStatement,
    last_used: u64,
}

/// LRU cache of prepared statements with a per-connection capacity.
///
/// Capacity 0 disables caching entirely: every lookup misses and every
/// insert is dropped, forcing one server prepare per execution.
pub(crate) struct StatementCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<(u32, String), Entry>,
}

impl StatementCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn normalize(sql: &str) -> &str {
        sql.trim()
    }

    /// Look up a statement for this connection, refreshing its LRU position.
    pub(crate) fn get(&mut self, connection_id: u32, sql: &str) -> Option<CachedStatement> {
        if self.capacity == 0 {
            return None;
        }
        self.tick += 1;
        let key = (connection_id, Self::normalize(sql).to_string());
        let entry = self.entries.get_mut(&key)?;
        entry.last_used = self.tick;
        Some(entry.stmt.clone())
    }

    /// Store a freshly prepared statement; returns the statement evicted to
    /// make room, if any, so the caller can close it on the server.
    pub(crate) fn insert(
        &mut self,
        connection_id: u32,
        sql: &str,
        stmt: CachedStatement,
    ) -> Option<CachedStatement> {
        if self.capacity == 0 {
            return None;
        }
        self.tick += 1;
        let key = (connection_id, Self::normalize(sql).to_string());

        let mut evicted = None;
        let held = self
            .entries
            .keys()
            .filter(|(conn, _)| *conn == connection_id)
            .count();
        if held >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(lru_key) = self
                .entries
                .iter()
                .filter(|((conn, _), _)| *conn == connection_id)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                evicted = self.entries.remove(&lru_key).map(|e| e.stmt);
            }
        }

        self.entries.insert(
            key,
            Entry {
                stmt,
                last_used: self.tick,
            },
        );
        evicted
    }

    /// Drop every entry belonging to a connection, as one unit.
    pub(crate) fn invalidate_connection(&mut self, connection_id: u32) {
        self.entries.retain(|(conn, _), _| *conn != connection_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(id: u32) -> CachedStatement {
        CachedStatement {
            statement_id: id,
            num_params: 1,
            param_types: vec![0xFD],
            columns: Vec::new(),
        }
    }

    #[test]
    fn hit_after_insert() {
        let mut cache = StatementCache::new(4);
        assert!(cache.get(1, "SELECT ?").is_none());
        cache.insert(1, "SELECT ?", stmt(10));
        assert_eq!(cache.get(1, "SELECT ?").unwrap().statement_id, 10);
        // normalization: surrounding whitespace does not miss
        assert_eq!(cache.get(1, "  SELECT ?  ").unwrap().statement_id, 10);
    }

    #[test]
    fn entries_are_scoped_per_connection() {
        let mut cache = StatementCache::new(4);
        cache.insert(1, "SELECT ?", stmt(10));
        assert!(cache.get(2, "SELECT ?").is_none());
    }

    #[test]
    fn lru_eviction_per_connection() {
        let mut cache = StatementCache::new(2);
        cache.insert(1, "a", stmt(1));
        cache.insert(1, "b", stmt(2));
        // refresh "a" so "b" is now the least recently used
        cache.get(1, "a");
        let evicted = cache.insert(1, "c", stmt(3)).unwrap();
        assert_eq!(evicted.statement_id, 2);
        assert!(cache.get(1, "a").is_some());
        assert!(cache.get(1, "b").is_none());
        assert!(cache.get(1, "c").is_some());
        // another connection's entries never count against conn 1
        cache.insert(7, "a", stmt(9));
        assert!(cache.get(1, "a").is_some());
    }

    #[test]
    fn invalidate_drops_connection_wholesale() {
        let mut cache = StatementCache::new(4);
        cache.insert(1, "a", stmt(1));
        cache.insert(1, "b", stmt(2));
        cache.insert(2, "a", stmt(3));
        cache.invalidate_connection(1);
        assert!(cache.get(1, "a").is_none());
        assert!(cache.get(1, "b").is_none());
        assert_eq!(cache.get(2, "a").unwrap().statement_id, 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let mut cache = StatementCache::new(0);
        cache.insert(1, "a", stmt(1));
        assert!(cache.get(1, "a").is_none());
        assert_eq!(cache.len(), 0);
    }
}
