//! Session-local prepared statements and portals.
//!
//! Both maps are owned exclusively by their session and discarded at
//! disconnect; nothing here is shared across connections. The empty string
//! names the distinguished unnamed slot, overwritten on each use.

use std::collections::HashMap;
use std::sync::Arc;

use corvus_core::plan::{FieldInfo, Plan};
use corvus_core::tcop::BoundPlan;

/// A statement produced by Parse. Immutable once cached.
#[derive(Debug)]
pub struct PreparedStatement {
    pub name: String,
    pub sql: String,
    /// Uppercased first token; drives the skip filter and command tags.
    pub kind: String,
    /// `None` for statements the skip filter suppressed at Parse time.
    pub plan: Option<Arc<Plan>>,
    /// Parameter type OIDs as declared by the client (0 = unspecified).
    pub param_types: Vec<i32>,
}

/// A statement bound to parameter values, ready to execute.
#[derive(Debug)]
pub struct Portal {
    pub name: String,
    pub statement: Arc<PreparedStatement>,
    pub bound: BoundPlan,
    pub row_desc: Vec<FieldInfo>,
}

/// Named statements plus the unnamed slot.
#[derive(Debug, Default)]
pub struct StatementCache {
    named: HashMap<String, Arc<PreparedStatement>>,
    unnamed: Option<Arc<PreparedStatement>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a statement. Re-Parse of an existing named statement is a
    /// protocol error; the unnamed slot is simply overwritten.
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) -> Result<(), String> {
        if statement.name.is_empty() {
            self.unnamed = Some(statement);
            return Ok(());
        }
        if self.named.contains_key(&statement.name) {
            return Err(format!(
                "prepared statement \"{}\" already exists",
                statement.name
            ));
        }
        self.named.insert(statement.name.clone(), statement);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PreparedStatement>> {
        if name.is_empty() {
            self.unnamed.clone()
        } else {
            self.named.get(name).cloned()
        }
    }

    pub fn remove(&mut self, name: &str) {
        if name.is_empty() {
            self.unnamed = None;
        } else {
            self.named.remove(name);
        }
    }
}

/// Bound portals by name. Bind replaces same-name portals atomically.
#[derive(Debug, Default)]
pub struct PortalTable {
    portals: HashMap<String, Portal>,
}

impl PortalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, portal: Portal) {
        self.portals.insert(portal.name.clone(), portal);
    }

    pub fn get(&self, name: &str) -> Option<&Portal> {
        self.portals.get(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.portals.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(name: &str) -> Arc<PreparedStatement> {
        Arc::new(PreparedStatement {
            name: name.to_string(),
            sql: "SELECT 1".to_string(),
            kind: "SELECT".to_string(),
            plan: None,
            param_types: Vec::new(),
        })
    }

    #[test]
    fn test_named_statement_duplicate_rejected() {
        let mut cache = StatementCache::new();
        cache.insert(statement("s1")).unwrap();
        assert!(cache.insert(statement("s1")).is_err());
        assert!(cache.get("s1").is_some());
    }

    #[test]
    fn test_unnamed_statement_overwritten() {
        let mut cache = StatementCache::new();
        cache.insert(statement("")).unwrap();
        cache.insert(statement("")).unwrap();
        assert!(cache.get("").is_some());
    }

    #[test]
    fn test_missing_statement() {
        let cache = StatementCache::new();
        assert!(cache.get("nope").is_none());
        assert!(cache.get("").is_none());
    }

    #[test]
    fn test_portal_replacement() {
        use corvus_core::value::Value;

        let mut portals = PortalTable::new();
        let stmt = statement("s1");
        let plan = Arc::new(corvus_core::plan::Plan {
            node: corvus_core::plan::PlanNode::Begin,
            kind: "BEGIN".to_string(),
            row_desc: Vec::new(),
            param_count: 0,
        });
        portals.put(Portal {
            name: "p1".to_string(),
            statement: Arc::clone(&stmt),
            bound: BoundPlan {
                plan: Arc::clone(&plan),
                params: vec![Value::Integer(1)],
            },
            row_desc: Vec::new(),
        });
        portals.put(Portal {
            name: "p1".to_string(),
            statement: stmt,
            bound: BoundPlan {
                plan,
                params: vec![Value::Integer(2)],
            },
            row_desc: Vec::new(),
        });
        assert_eq!(
            portals.get("p1").unwrap().bound.params,
            vec![Value::Integer(2)]
        );
    }
}
