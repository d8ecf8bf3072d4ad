//! Access control: method grants, field permissions and record rules.
//!
//! All tables live behind `RwLock`s so that grants can be changed through
//! a shared, bootstrapped registry.

use crate::condition::Condition;
use crate::method::Frame;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The user that bypasses every check.
pub const SUPERUSER_ID: i64 = 1;

/// The group every user implicitly belongs to.
pub const GROUP_EVERYONE: &str = "everyone";

/// A set of access kinds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permission(u8);

impl Permission {
    pub const NONE: Permission = Permission(0);
    pub const READ: Permission = Permission(1);
    pub const WRITE: Permission = Permission(1 << 1);
    pub const UNLINK: Permission = Permission(1 << 2);
    pub const ALL: Permission = Permission(0b111);

    /// Whether every kind in `other` is also in `self`.
    pub const fn contains(self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Permission) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn without(self, other: Permission) -> Permission {
        Permission(self.0 & !other.0)
    }
}

impl BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Permission) -> Permission {
        Permission(self.0 | rhs.0)
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Permission::READ) {
            names.push("READ");
        }
        if self.contains(Permission::WRITE) {
            names.push("WRITE");
        }
        if self.contains(Permission::UNLINK) {
            names.push("UNLINK");
        }
        if names.is_empty() {
            names.push("NONE");
        }
        write!(f, "Permission({})", names.join(" | "))
    }
}

/// Resolves a user id to the groups it belongs to.
pub trait GroupResolver: Send + Sync {
    fn groups(&self, uid: i64) -> Vec<String>;
}

/// In-memory user/group memberships.
#[derive(Debug, Default)]
pub struct Memberships {
    members: RwLock<HashMap<i64, BTreeSet<String>>>,
}

impl Memberships {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, uid: i64, group: impl Into<String>) {
        write(&self.members).entry(uid).or_default().insert(group.into());
    }

    pub fn remove(&self, uid: i64, group: &str) {
        if let Some(groups) = write(&self.members).get_mut(&uid) {
            groups.remove(group);
        }
    }
}

impl GroupResolver for Memberships {
    fn groups(&self, uid: i64) -> Vec<String> {
        read(&self.members)
            .get(&uid)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// A row-level access rule.
///
/// A rule without a group is global and always applies; group rules apply
/// to members of their group.
#[derive(Debug, Clone)]
pub struct RecordRule {
    pub name: String,
    pub group: Option<String>,
    pub condition: Condition,
    pub perms: Permission,
}

impl RecordRule {
    pub fn global(name: impl Into<String>, condition: Condition, perms: Permission) -> Self {
        Self {
            name: name.into(),
            group: None,
            condition,
            perms,
        }
    }

    pub fn for_group(
        name: impl Into<String>,
        group: impl Into<String>,
        condition: Condition,
        perms: Permission,
    ) -> Self {
        Self {
            name: name.into(),
            group: Some(group.into()),
            condition,
            perms,
        }
    }
}

#[derive(Debug, Default)]
struct MethodAcl {
    groups: HashSet<String>,
    /// group -> (caller model, caller method)
    scoped: HashMap<String, HashSet<(String, String)>>,
}

type Key = (String, String);

fn key(model: &str, name: &str) -> Key {
    (model.to_string(), name.to_string())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Security tables of a registry.
pub struct Security {
    resolver: RwLock<Arc<dyn GroupResolver>>,
    methods: RwLock<HashMap<Key, MethodAcl>>,
    fields: RwLock<HashMap<Key, HashMap<String, Permission>>>,
    rules: RwLock<HashMap<String, Vec<RecordRule>>>,
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Security")
            .field("methods", &read(&self.methods).len())
            .field("fields", &read(&self.fields).len())
            .field("rules", &read(&self.rules).len())
            .finish_non_exhaustive()
    }
}

impl Default for Security {
    fn default() -> Self {
        Self::new(Arc::new(Memberships::new()))
    }
}

impl Security {
    pub fn new(resolver: Arc<dyn GroupResolver>) -> Self {
        Self {
            resolver: RwLock::new(resolver),
            methods: RwLock::new(HashMap::new()),
            fields: RwLock::new(HashMap::new()),
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the group resolver.
    pub fn set_resolver(&self, resolver: Arc<dyn GroupResolver>) {
        *write(&self.resolver) = resolver;
    }

    /// Groups of a user, `everyone` included.
    pub fn groups_of(&self, uid: i64) -> Vec<String> {
        let mut groups = read(&self.resolver).groups(uid);
        if !groups.iter().any(|g| g == GROUP_EVERYONE) {
            groups.push(GROUP_EVERYONE.to_string());
        }
        groups
    }

    // ------------------------------------------------------------------
    // Methods
    // ------------------------------------------------------------------

    /// Allow members of `group` to call `model.method`.
    pub fn allow_method(&self, model: &str, method: &str, group: &str) {
        tracing::debug!(model, method, group, "Granting method access");
        write(&self.methods)
            .entry(key(model, method))
            .or_default()
            .groups
            .insert(group.to_string());
    }

    /// Allow members of `group` to call `model.method`, but only from
    /// `caller_model.caller_method`.
    pub fn allow_method_from(
        &self,
        model: &str,
        method: &str,
        group: &str,
        caller_model: &str,
        caller_method: &str,
    ) {
        write(&self.methods)
            .entry(key(model, method))
            .or_default()
            .scoped
            .entry(group.to_string())
            .or_default()
            .insert(key(caller_model, caller_method));
    }

    /// Remove every grant of `group` on `model.method`.
    pub fn revoke_method(&self, model: &str, method: &str, group: &str) {
        tracing::debug!(model, method, group, "Revoking method access");
        if let Some(acl) = write(&self.methods).get_mut(&key(model, method)) {
            acl.groups.remove(group);
            acl.scoped.remove(group);
        }
    }

    /// Whether `uid` may call `model.method` from `caller`: through a grant
    /// to one of their groups, or a grant scoped to the calling method.
    pub fn can_call(&self, uid: i64, model: &str, method: &str, caller: Option<&Frame>) -> bool {
        if uid == SUPERUSER_ID {
            return true;
        }
        let methods = read(&self.methods);
        let Some(acl) = methods.get(&key(model, method)) else {
            return false;
        };
        let groups = self.groups_of(uid);
        groups.iter().any(|group| {
            acl.groups.contains(group)
                || caller.is_some_and(|frame| {
                    acl.scoped
                        .get(group)
                        .is_some_and(|callers| callers.contains(&key(&frame.model, &frame.method)))
                })
        })
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    /// Grant `perm` on `model.field` to `group`.
    pub fn allow_field(&self, model: &str, field: &str, group: &str, perm: Permission) {
        let mut fields = write(&self.fields);
        let acl = fields.entry(key(model, field)).or_insert_with(default_field_acl);
        let entry = acl.entry(group.to_string()).or_default();
        *entry = *entry | perm;
    }

    /// Remove `perm` on `model.field` from `group`.
    pub fn revoke_field(&self, model: &str, field: &str, group: &str, perm: Permission) {
        let mut fields = write(&self.fields);
        let acl = fields.entry(key(model, field)).or_insert_with(default_field_acl);
        if let Some(entry) = acl.get_mut(group) {
            *entry = entry.without(perm);
        }
    }

    /// Whether `uid` holds `perm` on `model.field`.
    pub fn field_allowed(&self, uid: i64, model: &str, field: &str, perm: Permission) -> bool {
        if uid == SUPERUSER_ID {
            return true;
        }
        let fields = read(&self.fields);
        let Some(acl) = fields.get(&key(model, field)) else {
            return Permission::READ.union(Permission::WRITE).contains(perm);
        };
        let granted = self
            .groups_of(uid)
            .iter()
            .filter_map(|g| acl.get(g))
            .fold(Permission::NONE, |acc, p| acc | *p);
        granted.contains(perm)
    }

    // ------------------------------------------------------------------
    // Record rules
    // ------------------------------------------------------------------

    pub fn add_rule(&self, model: &str, rule: RecordRule) {
        tracing::debug!(model, rule = %rule.name, perms = ?rule.perms, "Adding record rule");
        write(&self.rules)
            .entry(model.to_string())
            .or_default()
            .push(rule);
    }

    pub fn remove_rule(&self, model: &str, name: &str) {
        if let Some(rules) = write(&self.rules).get_mut(model) {
            rules.retain(|r| r.name != name);
        }
    }

    /// The condition restricting `uid`'s access of kind `perm` to `model`,
    /// if any: global rules AND-ed, then the OR of the user's group rules
    /// AND-ed in.
    pub fn rule_condition(&self, uid: i64, model: &str, perm: Permission) -> Option<Condition> {
        if uid == SUPERUSER_ID {
            return None;
        }
        let rules = read(&self.rules);
        let rules = rules.get(model)?;
        let groups = self.groups_of(uid);

        let mut global = Condition::new();
        let mut by_group = Condition::new();
        for rule in rules.iter().filter(|r| r.perms.intersects(perm)) {
            match &rule.group {
                None => global = global.and_cond(rule.condition.clone()),
                Some(group) if groups.contains(group) => {
                    by_group = by_group.or_cond(rule.condition.clone());
                }
                Some(_) => {}
            }
        }
        let cond = global.and_cond(by_group);
        if cond.is_empty() { None } else { Some(cond) }
    }
}

impl Permission {
    #[must_use]
    pub const fn union(self, other: Permission) -> Permission {
        Permission(self.0 | other.0)
    }
}

fn default_field_acl() -> HashMap<String, Permission> {
    HashMap::from([(
        GROUP_EVERYONE.to_string(),
        Permission::READ | Permission::WRITE,
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::field;

    fn security() -> (Security, Arc<Memberships>) {
        let members = Arc::new(Memberships::new());
        (Security::new(members.clone()), members)
    }

    fn frame(model: &str, method: &str) -> Frame {
        Frame {
            model: model.into(),
            method: method.into(),
            layer: 0,
        }
    }

    #[test]
    fn method_grants() {
        let (sec, members) = security();
        members.add(7, "sales");

        assert!(sec.can_call(SUPERUSER_ID, "Order", "Confirm", None));
        assert!(!sec.can_call(7, "Order", "Confirm", None));

        sec.allow_method("Order", "Confirm", "sales");
        assert!(sec.can_call(7, "Order", "Confirm", None));
        assert!(!sec.can_call(8, "Order", "Confirm", None));

        sec.revoke_method("Order", "Confirm", "sales");
        assert!(!sec.can_call(7, "Order", "Confirm", None));

        sec.allow_method("Order", "Confirm", GROUP_EVERYONE);
        assert!(sec.can_call(8, "Order", "Confirm", None));
    }

    #[test]
    fn caller_scoped_grants() {
        let (sec, members) = security();
        members.add(7, "sales");
        sec.allow_method_from("Stock", "Reserve", "sales", "Order", "Confirm");

        assert!(!sec.can_call(7, "Stock", "Reserve", None));
        assert!(sec.can_call(7, "Stock", "Reserve", Some(&frame("Order", "Confirm"))));
        assert!(!sec.can_call(7, "Stock", "Reserve", Some(&frame("Order", "Cancel"))));
        // Running another method of the same model grants nothing.
        assert!(!sec.can_call(7, "Stock", "Reserve", Some(&frame("Stock", "Release"))));
        sec.allow_method_from("Stock", "Reserve", "sales", "Stock", "Release");
        assert!(sec.can_call(7, "Stock", "Reserve", Some(&frame("Stock", "Release"))));
        assert!(!sec.can_call(9, "Stock", "Reserve", Some(&frame("Stock", "Release"))));
    }

    #[test]
    fn field_permissions_default_to_everyone() {
        let (sec, members) = security();
        members.add(7, "hr");
        assert!(sec.field_allowed(8, "Employee", "Salary", Permission::READ));
        assert!(sec.field_allowed(8, "Employee", "Salary", Permission::WRITE));

        sec.revoke_field("Employee", "Salary", GROUP_EVERYONE, Permission::ALL);
        sec.allow_field("Employee", "Salary", "hr", Permission::READ);
        assert!(!sec.field_allowed(8, "Employee", "Salary", Permission::READ));
        assert!(sec.field_allowed(7, "Employee", "Salary", Permission::READ));
        assert!(!sec.field_allowed(7, "Employee", "Salary", Permission::WRITE));
        assert!(sec.field_allowed(SUPERUSER_ID, "Employee", "Salary", Permission::WRITE));
    }

    #[test]
    fn rules_combine_global_and_group() {
        let (sec, members) = security();
        members.add(7, "sales");
        sec.add_rule(
            "Order",
            RecordRule::global("active", field("Active").equals(true), Permission::ALL),
        );
        sec.add_rule(
            "Order",
            RecordRule::for_group("own", "sales", field("UserID").equals(7), Permission::READ),
        );
        sec.add_rule(
            "Order",
            RecordRule::for_group("team", "sales", field("TeamID").equals(3), Permission::READ),
        );

        assert!(sec.rule_condition(SUPERUSER_ID, "Order", Permission::READ).is_none());
        assert!(sec.rule_condition(7, "Invoice", Permission::READ).is_none());

        let cond = sec.rule_condition(7, "Order", Permission::READ).unwrap();
        assert_eq!(
            cond.serialize().to_string(),
            "[& [Active = true] | [UserID = 7] [TeamID = 3]]"
        );
        let cond = sec.rule_condition(7, "Order", Permission::UNLINK).unwrap();
        assert_eq!(cond.serialize().to_string(), "[[Active = true]]");
        let cond = sec.rule_condition(8, "Order", Permission::READ).unwrap();
        assert_eq!(cond.serialize().to_string(), "[[Active = true]]");

        sec.remove_rule("Order", "active");
        assert!(sec.rule_condition(8, "Order", Permission::READ).is_none());
    }

    #[test]
    fn permission_sets() {
        let rw = Permission::READ | Permission::WRITE;
        assert!(rw.contains(Permission::READ));
        assert!(!rw.contains(Permission::UNLINK));
        assert!(Permission::ALL.without(Permission::WRITE).contains(Permission::UNLINK));
        assert_eq!(format!("{:?}", rw), "Permission(READ | WRITE)");
    }
}
