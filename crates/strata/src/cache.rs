//! Per-transaction record cache.
//!
//! The cache maps `(model, id)` to the field values loaded so far, plus the
//! `(ours, theirs)` pairs of every many2many link model seen in the
//! transaction. Many2many reads are answered from those pairs once every
//! link of the record is known. It is owned by one environment and shared by every
//! environment derived from it, so it needs no locking.
//!
//! A lookup is a hit only when every requested field is present for every
//! requested id; a partial hit is a miss.

use std::collections::{BTreeSet, HashMap, HashSet};
use strata_core::{FieldMap, Value};

#[derive(Debug, Default)]
pub struct Cache {
    /// model -> id -> field -> value
    records: HashMap<String, HashMap<i64, FieldMap>>,
    /// link model -> cached pairs
    links: HashMap<String, Links>,
}

/// The `(ours, theirs)` pairs of one link model seen so far. A side id
/// is *known* once every pair it takes part in is cached; only known ids
/// are answered from here.
#[derive(Debug, Default)]
struct Links {
    pairs: BTreeSet<(i64, i64)>,
    known_ours: HashSet<i64>,
    known_theirs: HashSet<i64>,
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value of one field.
    pub fn get(&self, model: &str, id: i64, field: &str) -> Option<&Value> {
        let value = self.records.get(model)?.get(&id)?.get(field);
        tracing::trace!(model, id, field, hit = value.is_some(), "Cache lookup");
        value
    }

    /// Every cached field of a record.
    pub fn record(&self, model: &str, id: i64) -> Option<&FieldMap> {
        self.records.get(model)?.get(&id)
    }

    /// Whether every field in `fields` is cached for every id in `ids`.
    pub fn contains(&self, model: &str, ids: &[i64], fields: &[&str]) -> bool {
        let Some(records) = self.records.get(model) else {
            return ids.is_empty();
        };
        ids.iter().all(|id| {
            records
                .get(id)
                .is_some_and(|values| fields.iter().all(|f| values.contains_key(*f)))
        })
    }

    pub fn set(&mut self, model: &str, id: i64, field: &str, value: Value) {
        self.entry(model, id).insert(field.to_string(), value);
    }

    /// Merge `values` into the cached record.
    pub fn update(&mut self, model: &str, id: i64, values: &FieldMap) {
        let entry = self.entry(model, id);
        for (name, value) in values {
            entry.insert(name.clone(), value.clone());
        }
    }

    fn entry(&mut self, model: &str, id: i64) -> &mut FieldMap {
        self.records
            .entry(model.to_string())
            .or_default()
            .entry(id)
            .or_default()
    }

    /// Forget everything cached for a record.
    pub fn invalidate_record(&mut self, model: &str, id: i64) {
        if let Some(records) = self.records.get_mut(model) {
            records.remove(&id);
        }
    }

    /// Forget some fields of a record.
    pub fn invalidate_fields(&mut self, model: &str, id: i64, fields: &[&str]) {
        if let Some(values) = self.records.get_mut(model).and_then(|r| r.get_mut(&id)) {
            for field in fields {
                values.shift_remove(*field);
            }
        }
    }

    /// Forget one field on every record of a model.
    pub fn invalidate_field(&mut self, model: &str, field: &str) {
        if let Some(records) = self.records.get_mut(model) {
            for values in records.values_mut() {
                values.shift_remove(field);
            }
        }
    }

    pub fn invalidate_model(&mut self, model: &str) {
        self.records.remove(model);
    }

    /// Drop every record and link.
    pub fn clear(&mut self) {
        self.records.clear();
        self.links.clear();
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.records.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Many2many links
    // ------------------------------------------------------------------

    /// Replace the links of `ours` with `theirs`; `ours` is then fully
    /// known.
    pub fn set_links(&mut self, link: &str, ours: i64, theirs: &[i64]) {
        let links = self.links.entry(link.to_string()).or_default();
        links.pairs.retain(|(o, _)| *o != ours);
        links.pairs.extend(theirs.iter().map(|t| (ours, *t)));
        links.known_ours.insert(ours);
    }

    /// Replace the links of `theirs` with `ours`; `theirs` is then fully
    /// known.
    pub fn set_reverse_links(&mut self, link: &str, theirs: i64, ours: &[i64]) {
        let links = self.links.entry(link.to_string()).or_default();
        links.pairs.retain(|(_, t)| *t != theirs);
        links.pairs.extend(ours.iter().map(|o| (*o, theirs)));
        links.known_theirs.insert(theirs);
    }

    /// Ids linked to `ours`, in ascending order, when every link of `ours`
    /// is cached.
    pub fn linked(&self, link: &str, ours: i64) -> Option<Vec<i64>> {
        let links = self.links.get(link)?;
        if !links.known_ours.contains(&ours) {
            return None;
        }
        Some(
            links
                .pairs
                .range((ours, i64::MIN)..=(ours, i64::MAX))
                .map(|(_, t)| *t)
                .collect(),
        )
    }

    /// Ids linked to `theirs`, in ascending order, when every link of
    /// `theirs` is cached.
    pub fn reverse_linked(&self, link: &str, theirs: i64) -> Option<Vec<i64>> {
        let links = self.links.get(link)?;
        if !links.known_theirs.contains(&theirs) {
            return None;
        }
        Some(
            links
                .pairs
                .iter()
                .filter(|(_, t)| *t == theirs)
                .map(|(o, _)| *o)
                .collect(),
        )
    }

    /// Forget the pairs whose `ours` side is one of `ids`.
    pub fn remove_ours(&mut self, link: &str, ids: &[i64]) {
        if let Some(links) = self.links.get_mut(link) {
            links.pairs.retain(|(o, _)| !ids.contains(o));
            links.known_ours.retain(|o| !ids.contains(o));
        }
    }

    /// Forget the pairs whose `theirs` side is one of `ids`.
    pub fn remove_theirs(&mut self, link: &str, ids: &[i64]) {
        if let Some(links) = self.links.get_mut(link) {
            links.pairs.retain(|(_, t)| !ids.contains(t));
            links.known_theirs.retain(|t| !ids.contains(t));
        }
    }

    /// Forget everything cached about one link model.
    pub fn forget_links(&mut self, link: &str) {
        self.links.remove(link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_require_every_field_and_id() {
        let mut cache = Cache::new();
        cache.set("User", 1, "Name", Value::from("ann"));
        cache.set("User", 1, "Age", Value::from(30));
        cache.set("User", 2, "Name", Value::from("bob"));

        assert!(cache.contains("User", &[1], &["Name", "Age"]));
        assert!(cache.contains("User", &[1, 2], &["Name"]));
        assert!(!cache.contains("User", &[1, 2], &["Age"]));
        assert!(!cache.contains("User", &[3], &["Name"]));
        assert!(!cache.contains("Post", &[1], &["Title"]));
        assert!(cache.contains("Post", &[], &["Title"]));
        assert_eq!(cache.get("User", 2, "Name"), Some(&Value::from("bob")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidation() {
        let mut cache = Cache::new();
        let mut values = FieldMap::new();
        values.insert("Name".into(), Value::from("ann"));
        values.insert("Age".into(), Value::from(30));
        cache.update("User", 1, &values);
        cache.update("User", 2, &values);

        cache.invalidate_fields("User", 1, &["Age"]);
        assert!(cache.get("User", 1, "Age").is_none());
        assert!(cache.get("User", 1, "Name").is_some());

        cache.invalidate_field("User", "Name");
        assert!(cache.get("User", 2, "Name").is_none());
        assert!(cache.get("User", 2, "Age").is_some());

        cache.invalidate_record("User", 2);
        assert!(cache.record("User", 2).is_none());

        cache.invalidate_model("User");
        assert!(cache.is_empty());
    }

    #[test]
    fn links_answer_only_for_known_ids() {
        let mut cache = Cache::new();
        assert_eq!(cache.linked("PostTagRel", 1), None);

        cache.set_links("PostTagRel", 1, &[11, 10]);
        cache.set_links("PostTagRel", 2, &[10]);
        assert_eq!(cache.linked("PostTagRel", 1), Some(vec![10, 11]));
        // Tag 10 was only seen from the posts' side.
        assert_eq!(cache.reverse_linked("PostTagRel", 10), None);

        cache.set_reverse_links("PostTagRel", 10, &[2, 3]);
        assert_eq!(cache.reverse_linked("PostTagRel", 10), Some(vec![2, 3]));
        assert_eq!(cache.linked("PostTagRel", 1), Some(vec![11]));

        cache.set_links("PostTagRel", 2, &[]);
        assert_eq!(cache.reverse_linked("PostTagRel", 10), Some(vec![3]));
        assert_eq!(cache.linked("PostTagRel", 2), Some(vec![]));

        cache.remove_theirs("PostTagRel", &[11]);
        assert_eq!(cache.linked("PostTagRel", 1), Some(vec![]));
        cache.remove_ours("PostTagRel", &[1]);
        assert_eq!(cache.linked("PostTagRel", 1), None);

        cache.forget_links("PostTagRel");
        assert_eq!(cache.linked("PostTagRel", 2), None);
        cache.set_links("PostTagRel", 2, &[12]);
        cache.clear();
        assert_eq!(cache.linked("PostTagRel", 2), None);
    }
}
