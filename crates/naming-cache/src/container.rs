//! Three-tier wildcard rule index.
//!
//! Rules address their target service at one of three granularities:
//! an exact `(namespace, name)`, a whole namespace (`namespace/*`), or every
//! service (`*/*`). [`RuleContainer`] keeps one bucket per materialized key
//! in each tier. Wildcard rules are copied into every materialized bucket
//! below them, and a bucket created after wildcard rules exist is
//! backfilled with them, so a lookup never has to join tiers at read time.
//!
//! Every bucket carries a revision over its members, recomputed in the
//! mutation path as soon as its member set changes. Backfill keeps the most
//! specific bucket for a key holding exactly the rules of every tier above
//! it, so that bucket's revision also fingerprints the union read.
//!
//! All tiers sit behind one lock, which makes a fan-out atomic with respect
//! to readers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use naming_core::revision::composite_revision;
use naming_core::{CacheEntity, MatchLevel, ServiceKey};
use parking_lot::RwLock;

/// Rules effective for a lookup, plus the revision of that rule set.
#[derive(Debug, Clone)]
pub struct RuleSet<T> {
    /// Matching rules.
    pub rules: Vec<Arc<T>>,
    /// Fingerprint of the rule set, empty when there are no rules.
    pub revision: String,
}

impl<T> Default for RuleSet<T> {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            revision: String::new(),
        }
    }
}

impl<T> RuleSet<T> {
    /// Whether no rule matched.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of matching rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

impl<T: CacheEntity> RuleSet<T> {
    /// IDs of the matching rules, in order.
    pub fn ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id()).collect()
    }
}

/// Tier a bucket member came from. Orders first-match reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Origin {
    /// Placed here by the rule's own target.
    Native,
    /// Copied from the namespace tier.
    Namespace,
    /// Copied from the global tier.
    Global,
}

#[derive(Debug)]
struct Member<T> {
    rule: Arc<T>,
    origin: Origin,
}

#[derive(Debug)]
struct Bucket<T> {
    members: BTreeMap<String, Member<T>>,
    revision: String,
}

impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Self {
            members: BTreeMap::new(),
            revision: String::new(),
        }
    }
}

impl<T: CacheEntity> Bucket<T> {
    fn put(&mut self, rule: &Arc<T>, origin: Origin) {
        let id = rule.id().to_string();
        let origin = match self.members.get(&id) {
            Some(existing) => existing.origin.min(origin),
            None => origin,
        };
        self.members.insert(
            id,
            Member {
                rule: Arc::clone(rule),
                origin,
            },
        );
    }

    fn has_native(&self) -> bool {
        self.members.values().any(|m| m.origin == Origin::Native)
    }

    fn natives(&self) -> impl Iterator<Item = &Arc<T>> + '_ {
        self.members
            .values()
            .filter(|m| m.origin == Origin::Native)
            .map(|m| &m.rule)
    }

    fn refresh_revision(&mut self) {
        self.revision = if self.members.is_empty() {
            String::new()
        } else {
            let revisions: Vec<&str> = self.members.values().map(|m| m.rule.revision()).collect();
            composite_revision(&revisions)
        };
    }

    /// Own rules first, then namespace copies, then global copies; by ID
    /// within each group.
    fn to_rule_set(&self) -> RuleSet<T> {
        let mut members: Vec<&Member<T>> = self.members.values().collect();
        members.sort_by_key(|m| m.origin);
        RuleSet {
            rules: members.into_iter().map(|m| Arc::clone(&m.rule)).collect(),
            revision: self.revision.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Slot {
    Exact(String, String),
    Namespace(String),
    Global,
}

#[derive(Debug)]
struct Placed<T> {
    rule: Arc<T>,
    targets: Vec<ServiceKey>,
}

#[derive(Debug)]
struct Tiers<T> {
    exact: HashMap<String, HashMap<String, Bucket<T>>>,
    namespace: HashMap<String, Bucket<T>>,
    global: Bucket<T>,
    rules: HashMap<String, Placed<T>>,
}

impl<T> Default for Tiers<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            namespace: HashMap::new(),
            global: Bucket::default(),
            rules: HashMap::new(),
        }
    }
}

impl<T: CacheEntity> Tiers<T> {
    fn bucket_mut(&mut self, slot: &Slot) -> Option<&mut Bucket<T>> {
        match slot {
            Slot::Exact(ns, name) => self.exact.get_mut(ns).and_then(|m| m.get_mut(name)),
            Slot::Namespace(ns) => self.namespace.get_mut(ns),
            Slot::Global => Some(&mut self.global),
        }
    }

    fn insert(&mut self, rule: &Arc<T>, target: &ServiceKey, touched: &mut HashSet<Slot>) {
        match target.match_level() {
            MatchLevel::Exact => {
                let ns = target.namespace.as_str();
                let name = target.name.as_str();
                if !self.exact.get(ns).is_some_and(|m| m.contains_key(name)) {
                    let mut bucket = Bucket::default();
                    if let Some(ns_bucket) = self.namespace.get(ns) {
                        for inherited in ns_bucket.natives() {
                            bucket.put(inherited, Origin::Namespace);
                        }
                    }
                    for inherited in self.global.natives() {
                        bucket.put(inherited, Origin::Global);
                    }
                    self.exact
                        .entry(ns.to_string())
                        .or_default()
                        .insert(name.to_string(), bucket);
                }
                if let Some(bucket) = self.exact.get_mut(ns).and_then(|m| m.get_mut(name)) {
                    bucket.put(rule, Origin::Native);
                }
                touched.insert(Slot::Exact(ns.to_string(), name.to_string()));
            }
            MatchLevel::Namespace => {
                let ns = target.namespace.as_str();
                if !self.namespace.contains_key(ns) {
                    let mut bucket = Bucket::default();
                    for inherited in self.global.natives() {
                        bucket.put(inherited, Origin::Global);
                    }
                    self.namespace.insert(ns.to_string(), bucket);
                }
                if let Some(bucket) = self.namespace.get_mut(ns) {
                    bucket.put(rule, Origin::Native);
                }
                touched.insert(Slot::Namespace(ns.to_string()));
                if let Some(services) = self.exact.get_mut(ns) {
                    for (name, bucket) in services.iter_mut() {
                        bucket.put(rule, Origin::Namespace);
                        touched.insert(Slot::Exact(ns.to_string(), name.clone()));
                    }
                }
            }
            MatchLevel::Global => {
                self.global.put(rule, Origin::Native);
                touched.insert(Slot::Global);
                for (ns, bucket) in self.namespace.iter_mut() {
                    bucket.put(rule, Origin::Global);
                    touched.insert(Slot::Namespace(ns.clone()));
                }
                for (ns, services) in self.exact.iter_mut() {
                    for (name, bucket) in services.iter_mut() {
                        bucket.put(rule, Origin::Global);
                        touched.insert(Slot::Exact(ns.clone(), name.clone()));
                    }
                }
            }
        }
    }

    fn remove(&mut self, id: &str, target: &ServiceKey, touched: &mut HashSet<Slot>) {
        let mut take = |bucket: &mut Bucket<T>, slot: Slot| {
            if bucket.members.remove(id).is_some() {
                touched.insert(slot);
            }
        };
        match target.match_level() {
            MatchLevel::Exact => {
                let ns = &target.namespace;
                let name = &target.name;
                if let Some(bucket) = self.exact.get_mut(ns).and_then(|m| m.get_mut(name)) {
                    take(bucket, Slot::Exact(ns.clone(), name.clone()));
                }
            }
            MatchLevel::Namespace => {
                let ns = &target.namespace;
                if let Some(bucket) = self.namespace.get_mut(ns) {
                    take(bucket, Slot::Namespace(ns.clone()));
                }
                if let Some(services) = self.exact.get_mut(ns) {
                    for (name, bucket) in services.iter_mut() {
                        take(bucket, Slot::Exact(ns.clone(), name.clone()));
                    }
                }
            }
            MatchLevel::Global => {
                take(&mut self.global, Slot::Global);
                for (ns, bucket) in self.namespace.iter_mut() {
                    take(bucket, Slot::Namespace(ns.clone()));
                }
                for (ns, services) in self.exact.iter_mut() {
                    for (name, bucket) in services.iter_mut() {
                        take(bucket, Slot::Exact(ns.clone(), name.clone()));
                    }
                }
            }
        }
    }

    /// Recompute the revisions of touched buckets and drop buckets that no
    /// longer hold a rule of their own. The global bucket always stays.
    fn settle(&mut self, touched: HashSet<Slot>) {
        for slot in touched {
            let Some(bucket) = self.bucket_mut(&slot) else {
                continue;
            };
            bucket.refresh_revision();
            if bucket.has_native() {
                continue;
            }
            match slot {
                Slot::Exact(ns, name) => {
                    if let Some(services) = self.exact.get_mut(&ns) {
                        services.remove(&name);
                        if services.is_empty() {
                            self.exact.remove(&ns);
                        }
                    }
                }
                Slot::Namespace(ns) => {
                    self.namespace.remove(&ns);
                }
                Slot::Global => {}
            }
        }
    }
}

/// Wildcard-aware index of rules by target service.
///
/// Callbacks passed to [`iterate`](Self::iterate) run under the container's
/// read lock and must not call back into the same container.
#[derive(Debug)]
pub struct RuleContainer<T> {
    tiers: RwLock<Tiers<T>>,
}

impl<T> Default for RuleContainer<T> {
    fn default() -> Self {
        Self {
            tiers: RwLock::new(Tiers::default()),
        }
    }
}

impl<T: CacheEntity> RuleContainer<T> {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `rule`, placing it under each of `targets`.
    ///
    /// A rule already present is first removed from every bucket it was in.
    pub fn upsert(&self, rule: Arc<T>, targets: Vec<ServiceKey>) {
        let mut touched = HashSet::new();
        let mut tiers = self.tiers.write();
        if let Some(old) = tiers.rules.remove(rule.id()) {
            for target in &old.targets {
                tiers.remove(old.rule.id(), target, &mut touched);
            }
        }
        for target in &targets {
            tiers.insert(&rule, target, &mut touched);
        }
        tiers
            .rules
            .insert(rule.id().to_string(), Placed { rule, targets });
        tiers.settle(touched);
    }

    /// Remove a rule from its own buckets and every bucket it was copied to.
    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        let mut touched = HashSet::new();
        let mut tiers = self.tiers.write();
        let placed = tiers.rules.remove(id)?;
        for target in &placed.targets {
            tiers.remove(id, target, &mut touched);
        }
        tiers.settle(touched);
        Some(placed.rule)
    }

    /// Look up a rule by ID.
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.tiers.read().rules.get(id).map(|p| Arc::clone(&p.rule))
    }

    /// Targets a rule was placed under.
    pub fn targets(&self, id: &str) -> Option<Vec<ServiceKey>> {
        self.tiers.read().rules.get(id).map(|p| p.targets.clone())
    }

    /// The most specific bucket for `key`: the exact bucket if one exists,
    /// else the namespace bucket, else the global bucket.
    ///
    /// The returned rules include wildcard rules copied into that bucket.
    pub fn first_match(&self, key: &ServiceKey) -> RuleSet<T> {
        let tiers = self.tiers.read();
        let ns = key.namespace.as_str();
        let bucket = match key.match_level() {
            MatchLevel::Exact => tiers
                .exact
                .get(ns)
                .and_then(|m| m.get(key.name.as_str()))
                .or_else(|| tiers.namespace.get(ns))
                .unwrap_or(&tiers.global),
            MatchLevel::Namespace => tiers.namespace.get(ns).unwrap_or(&tiers.global),
            MatchLevel::Global => &tiers.global,
        };
        bucket.to_rule_set()
    }

    /// Rules addressed to `key` at each tier, concatenated: exact rules,
    /// then namespace rules, then global rules. Each rule appears once.
    ///
    /// The revision is read from the most specific existing bucket, which
    /// holds the same member set as the union.
    pub fn union(&self, key: &ServiceKey) -> RuleSet<T> {
        let tiers = self.tiers.read();
        let ns = key.namespace.as_str();
        let level = key.match_level();
        let mut buckets: Vec<&Bucket<T>> = Vec::with_capacity(3);
        if level == MatchLevel::Exact {
            buckets.extend(tiers.exact.get(ns).and_then(|m| m.get(key.name.as_str())));
        }
        if level != MatchLevel::Global {
            buckets.extend(tiers.namespace.get(ns));
        }
        buckets.push(&tiers.global);

        let mut rules: Vec<Arc<T>> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for bucket in &buckets {
            for rule in bucket.natives() {
                if seen.insert(rule.id()) {
                    rules.push(Arc::clone(rule));
                }
            }
        }

        let revision = buckets[0].revision.clone();
        RuleSet { rules, revision }
    }

    /// Visit every rule. Return `false` from `f` to stop early.
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<T>) -> bool,
    {
        let tiers = self.tiers.read();
        for placed in tiers.rules.values() {
            if !f(&placed.rule) {
                break;
            }
        }
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.tiers.read().rules.len()
    }

    /// Whether the container holds no rule.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of materialized exact and namespace buckets.
    pub fn bucket_count(&self) -> usize {
        let tiers = self.tiers.read();
        tiers.exact.values().map(HashMap::len).sum::<usize>() + tiers.namespace.len()
    }

    /// Drop every rule and bucket.
    pub fn clear(&self) {
        *self.tiers.write() = Tiers::default();
    }
}
