//! Snippets waiting to be executed.

use std::sync::{PoisonError, RwLock};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedSnippet {
    pub id: i64,
    pub code: String,
}

#[derive(Debug, Default)]
struct Inner {
    items: Vec<StagedSnippet>,
    next_id: i64,
}

/// Ordered list of captured snippets. Ids start at 0 and are never reused,
/// even after `clear`.
#[derive(Debug, Default)]
pub struct StagingList {
    inner: RwLock<Inner>,
}

impl StagingList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snippet and return its id.
    pub fn add(&self, code: impl Into<String>) -> i64 {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.push(StagedSnippet {
            id,
            code: code.into(),
        });
        id
    }

    pub fn get(&self, id: i64) -> Option<StagedSnippet> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.items.iter().find(|item| item.id == id).cloned()
    }

    /// Remove a snippet, returning it if it was staged.
    pub fn remove(&self, id: i64) -> Option<StagedSnippet> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let pos = inner.items.iter().position(|item| item.id == id)?;
        Some(inner.items.remove(pos))
    }

    pub fn list(&self) -> Vec<StagedSnippet> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.items.clone()
    }

    /// Snippets added after `start`, for incremental polling.
    pub fn list_after(&self, start: i64) -> Vec<StagedSnippet> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .items
            .iter()
            .filter(|item| item.id > start)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let list = StagingList::new();
        assert_eq!(list.add("a"), 0);
        assert_eq!(list.add("b"), 1);

        list.remove(1);
        list.clear();
        assert_eq!(list.add("c"), 2);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_get_and_remove() {
        let list = StagingList::new();
        let id = list.add("x = 1");

        assert_eq!(list.get(id).unwrap().code, "x = 1");
        assert_eq!(list.remove(id).unwrap().code, "x = 1");
        assert!(list.get(id).is_none());
        assert!(list.remove(id).is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_list_after() {
        let list = StagingList::new();
        for code in ["a", "b", "c", "d"] {
            list.add(code);
        }
        list.remove(2);

        let codes: Vec<String> = list.list_after(0).into_iter().map(|s| s.code).collect();
        assert_eq!(codes, vec!["b", "d"]);
        assert_eq!(list.list_after(-1).len(), 3);
        assert!(list.list_after(3).is_empty());
    }
}
