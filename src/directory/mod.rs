//! Directory Access Module
//!
//! The administrative layer talks to each node's directory service through
//! the [`Directory`] trait. Sessions are opened per node by a [`Connector`]
//! and must be released with [`Directory::unbind`] before moving on.

mod dn;
mod entry;
pub mod layout;
mod ldap;
mod memory;

pub use dn::{escape_value, Dn};
pub use entry::{Entry, Filter, Modification, Scope};
pub use layout::Layout;
pub use ldap::{LdapConnector, LdapSettings};
pub use memory::{ClusterBuilder, MemoryCluster, WriteOp, WriteRecord, INIT_SUCCEEDED, UPDATE_SUCCEEDED};

use crate::error::{Error, Result};

/// An authenticated session against one node's directory service.
/// Every operation is time-limited by the implementation.
#[async_trait::async_trait]
pub trait Directory: Send {
    /// Host this session is bound to
    fn host(&self) -> &str;

    /// Search below `base`. Fails with `NotFound` when `base` does not exist.
    async fn search(&mut self, base: &Dn, scope: Scope, filter: Option<&Filter>) -> Result<Vec<Entry>>;

    /// Add a new entry
    async fn add_entry(&mut self, entry: Entry) -> Result<()>;

    /// Apply modifications to an existing entry
    async fn modify(&mut self, dn: &Dn, mods: Vec<Modification>) -> Result<()>;

    /// Delete a leaf entry
    async fn delete_entry(&mut self, dn: &Dn) -> Result<()>;

    /// Release the session. Errors are logged, never returned.
    async fn unbind(&mut self);

    /// Read a single entry
    async fn get_entry(&mut self, dn: &Dn) -> Result<Entry> {
        let mut entries = self.search(dn, Scope::Base, None).await?;
        match entries.pop() {
            Some(entry) => Ok(entry),
            None => Err(Error::NotFound(dn.to_string())),
        }
    }

    /// Search that treats a missing base as an empty result
    async fn search_or_empty(
        &mut self,
        base: &Dn,
        scope: Scope,
        filter: Option<&Filter>,
    ) -> Result<Vec<Entry>> {
        match self.search(base, scope, filter).await {
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Delete an entry and everything below it, deepest first
    async fn delete_subtree(&mut self, base: &Dn) -> Result<()> {
        let mut entries = self.search(base, Scope::Subtree, None).await?;
        entries.sort_by_key(|e| std::cmp::Reverse(e.dn.depth()));
        for entry in entries {
            self.delete_entry(&entry.dn).await?;
        }
        Ok(())
    }
}

/// Opens authenticated sessions to named hosts
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Box<dyn Directory>>;
}
