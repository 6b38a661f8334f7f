//! Join alias allocation.
//!
//! An [`AliasGenerator`] lives for exactly one compilation. Every joined
//! table occurrence is identified by its path signature (the dotted relation
//! path leading to it); the first request for a signature allocates a fresh
//! alias and later requests for the same signature return it again.
//!
//! Aliases are `T_{table}` for the first occurrence of a table, then
//! `T1_{table}`, `T2_{table}` and so on, in first-seen order. Compiling the
//! same query shape twice therefore yields the same SQL text.

use std::collections::HashMap;

/// Allocates collision-free join aliases for one compilation.
#[derive(Debug, Default)]
pub struct AliasGenerator {
    assigned: HashMap<String, String>,
    counts: HashMap<String, usize>,
}

impl AliasGenerator {
    /// Creates an empty generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// The alias already assigned to `signature`, if any.
    pub fn get(&self, signature: &str) -> Option<&str> {
        self.assigned.get(signature).map(String::as_str)
    }

    /// Returns the alias of the `(table, signature)` pair, allocating one
    /// on first use.
    pub fn next(&mut self, table: &str, signature: &str) -> String {
        if let Some(alias) = self.assigned.get(signature) {
            return alias.clone();
        }
        let n = self.counts.entry(table.to_string()).or_insert(0);
        let alias = if *n == 0 {
            format!("T_{table}")
        } else {
            format!("T{n}_{table}")
        };
        *n += 1;
        self.assigned.insert(signature.to_string(), alias.clone());
        alias
    }

    /// The number of aliases allocated so far.
    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    /// Returns `true` if nothing was allocated yet.
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_signature_reuses_alias() {
        let mut gen = AliasGenerator::new();
        assert_eq!(gen.next("users", "User"), "T_users");
        assert_eq!(gen.next("users", "User"), "T_users");
        assert_eq!(gen.len(), 1);
    }

    #[test]
    fn test_distinct_paths_to_same_table() {
        let mut gen = AliasGenerator::new();
        assert_eq!(gen.next("categories", "Parent"), "T_categories");
        assert_eq!(gen.next("categories", "Parent.Parent"), "T1_categories");
        assert_eq!(gen.next("categories", "Parent.Parent.Parent"), "T2_categories");
        assert_eq!(gen.get("Parent.Parent"), Some("T1_categories"));
    }

    #[test]
    fn test_counts_are_per_table() {
        let mut gen = AliasGenerator::new();
        assert_eq!(gen.next("users", "User"), "T_users");
        assert_eq!(gen.next("images", "User.Avatar"), "T_images");
        assert_eq!(gen.next("users", "Editor"), "T1_users");
    }

    #[test]
    fn test_deterministic_across_generators() {
        let run = || {
            let mut gen = AliasGenerator::new();
            ["A", "B", "A.C", "B"]
                .iter()
                .map(|sig| gen.next("t", sig))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
        assert_eq!(run(), vec!["T_t", "T1_t", "T2_t", "T1_t"]);
        assert!(AliasGenerator::new().is_empty());
    }
}
