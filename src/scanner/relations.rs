//! Relation derivation and storage.
//!
//! Storage layout (all name segments key-encoded):
//!
//! - `packages/<name>` -> [`PackageRecord`], latest view of a package
//! - `maintains/<user>/<name>` -> [`MaintainedRecord`], user -> packages
//! - `dependents/<dependency>/<depending>` -> [`DependentRecord`]
//!
//! A relation `(user, depending, dependency)` exists when `user` maintains
//! `dependency` and `depending`'s latest version lists it. Facts are emitted
//! as soon as both halves are known, whichever arrives first.

use super::{Change, FactScanner};
use crate::bus::EventBus;
use crate::cursor::CursorState;
use crate::error::{Result, StoreError};
use crate::kv::{encode_key_component, KvStore};
use crate::types::{Relation, RelationKind, Sequence};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// The parts of a package document relations are derived from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub maintainers: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub dev_dependencies: BTreeSet<String>,
}

impl PackageInfo {
    /// Extract from a registry document. `None` if it has no usable name.
    ///
    /// Dependencies come from the version tagged `latest`; a document
    /// without one contributes maintainers only.
    pub fn from_doc(doc: &serde_json::Value) -> Option<Self> {
        let name = doc.get("name")?.as_str()?.to_string();
        if name.is_empty() {
            return None;
        }

        let maintainers = doc
            .get("maintainers")
            .and_then(|m| m.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|m| match m {
                        serde_json::Value::String(s) => Some(s.clone()),
                        other => other.get("name")?.as_str().map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let latest = doc
            .get("dist-tags")
            .and_then(|tags| tags.get("latest"))
            .and_then(|v| v.as_str())
            .and_then(|version| doc.get("versions")?.get(version));

        let names_of = |field: &str| -> BTreeSet<String> {
            latest
                .and_then(|v| v.get(field))
                .and_then(|deps| deps.as_object())
                .map(|deps| deps.keys().cloned().collect())
                .unwrap_or_default()
        };

        Some(Self {
            name,
            maintainers,
            dependencies: names_of("dependencies"),
            dev_dependencies: names_of("devDependencies"),
        })
    }

    fn kinds_for(&self, dependency: &str) -> Vec<RelationKind> {
        let mut kinds = Vec::new();
        if self.dependencies.contains(dependency) {
            kinds.push(RelationKind::Dependency);
        }
        if self.dev_dependencies.contains(dependency) {
            kinds.push(RelationKind::DevDependency);
        }
        kinds
    }

    fn all_dependencies(&self) -> BTreeSet<String> {
        self.dependencies
            .union(&self.dev_dependencies)
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PackageRecord {
    maintainers: BTreeSet<String>,
    dependencies: BTreeSet<String>,
    dev_dependencies: BTreeSet<String>,
    sequence: Sequence,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MaintainedRecord {
    package: String,
    active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DependentRecord {
    depending: String,
    /// Empty once the dependency has been dropped.
    kinds: Vec<RelationKind>,
    sequence: Sequence,
}

fn package_key(name: &str) -> Vec<u8> {
    format!("packages/{}", encode_key_component(name)).into_bytes()
}

fn maintains_prefix(user: &str) -> String {
    format!("maintains/{}/", encode_key_component(user))
}

fn maintains_key(user: &str, package: &str) -> Vec<u8> {
    format!("{}{}", maintains_prefix(user), encode_key_component(package)).into_bytes()
}

fn dependents_prefix(dependency: &str) -> String {
    format!("dependents/{}/", encode_key_component(dependency))
}

fn dependent_key(dependency: &str, depending: &str) -> Vec<u8> {
    format!("{}{}", dependents_prefix(dependency), encode_key_component(depending)).into_bytes()
}

fn decode<T: for<'de> Deserialize<'de>>(what: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Deserialization(format!("{}: {}", what, e)))
}

/// Scans changes into relations and emits them on the bus.
pub struct RelationScanner {
    store: Arc<dyn KvStore>,
    bus: Arc<EventBus>,
    cursor: CursorState,
    /// In-memory position. Raised before the cursor is persisted.
    position: RwLock<Option<Sequence>>,
}

impl RelationScanner {
    /// Resume from the persisted cursor.
    pub fn open(store: Arc<dyn KvStore>, bus: Arc<EventBus>) -> Result<Self> {
        let cursor = CursorState::open(store.clone())?;
        let position = cursor.load()?;
        debug!(event = "scanner resumed", sequence = ?position);
        Ok(Self {
            store,
            bus,
            cursor,
            position: RwLock::new(position),
        })
    }

    /// Apply one change. Returns the number of relations emitted.
    ///
    /// Changes at or below the current position were already applied and are
    /// skipped, so a feed page that overlaps the cursor is harmless.
    pub fn process(&self, change: &Change) -> Result<usize> {
        if let Some(current) = *self.position.read() {
            if change.seq <= current {
                trace!(sequence = change.seq.0, "change already applied");
                return Ok(0);
            }
        }

        let info = if change.deleted {
            None
        } else {
            change.doc.as_ref().and_then(PackageInfo::from_doc)
        };

        let emitted = match info {
            Some(info) => self.apply_package(&info, change.seq)?,
            None => 0,
        };

        *self.position.write() = Some(change.seq);
        self.cursor.advance(change.seq)?;
        Ok(emitted)
    }

    fn apply_package(&self, info: &PackageInfo, seq: Sequence) -> Result<usize> {
        let previous: PackageRecord = match self.store.get(&package_key(&info.name))? {
            Some(bytes) => decode("package record", &bytes)?,
            None => PackageRecord::default(),
        };

        // Maintainer index
        for user in &info.maintainers {
            if !previous.maintainers.contains(user) {
                self.put_maintained(user, &info.name, true)?;
            }
        }
        for user in previous.maintainers.difference(&info.maintainers) {
            self.put_maintained(user, &info.name, false)?;
        }

        let mut emitted = 0;

        // Outgoing edges: this package depends on others
        let previous_deps: BTreeSet<String> = previous
            .dependencies
            .union(&previous.dev_dependencies)
            .cloned()
            .collect();
        for dependency in info.all_dependencies() {
            let kinds = info.kinds_for(&dependency);
            let unchanged = previous_deps.contains(&dependency)
                && kinds == kinds_in(&previous, &dependency);
            if unchanged {
                continue;
            }
            let dependent = DependentRecord {
                depending: info.name.clone(),
                kinds,
                sequence: seq,
            };
            self.store.put(
                &dependent_key(&dependency, &info.name),
                &serde_json::to_vec(&dependent)?,
            )?;
            let maintainers = if dependency == info.name {
                info.maintainers.clone()
            } else {
                self.maintainers_of(&dependency)?
            };
            for user in maintainers {
                emitted += self.emit(&user, &dependency, &dependent);
            }
        }
        for dropped in previous_deps.difference(&info.all_dependencies()) {
            let tombstone = DependentRecord {
                depending: info.name.clone(),
                kinds: Vec::new(),
                sequence: seq,
            };
            self.store.put(
                &dependent_key(dropped, &info.name),
                &serde_json::to_vec(&tombstone)?,
            )?;
        }

        // Incoming edges: packages already known to depend on this one,
        // addressed to maintainers we had not seen before
        for user in info.maintainers.difference(&previous.maintainers) {
            for dependent in self.dependents_of(&info.name)? {
                if dependent.depending == info.name {
                    continue;
                }
                emitted += self.emit(user, &info.name, &dependent);
            }
        }

        // Written last: until it lands, reprocessing the change redoes
        // every derived write above.
        let record = PackageRecord {
            maintainers: info.maintainers.clone(),
            dependencies: info.dependencies.clone(),
            dev_dependencies: info.dev_dependencies.clone(),
            sequence: seq,
        };
        self.store
            .put(&package_key(&info.name), &serde_json::to_vec(&record)?)?;

        Ok(emitted)
    }

    fn put_maintained(&self, user: &str, package: &str, active: bool) -> Result<()> {
        let value = MaintainedRecord {
            package: package.to_string(),
            active,
        };
        self.store
            .put(&maintains_key(user, package), &serde_json::to_vec(&value)?)
    }

    fn maintainers_of(&self, package: &str) -> Result<BTreeSet<String>> {
        match self.store.get(&package_key(package))? {
            Some(bytes) => Ok(decode::<PackageRecord>("package record", &bytes)?.maintainers),
            None => Ok(BTreeSet::new()),
        }
    }

    fn dependents_of(&self, dependency: &str) -> Result<Vec<DependentRecord>> {
        let mut out = Vec::new();
        for item in self.store.scan_prefix(dependents_prefix(dependency).as_bytes()) {
            let (_, value) = item?;
            let record: DependentRecord = decode("dependent record", &value)?;
            if !record.kinds.is_empty() {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn emit(&self, user: &str, dependency: &str, dependent: &DependentRecord) -> usize {
        for kind in &dependent.kinds {
            self.bus.publish_relation(&Relation {
                kind: *kind,
                user: user.to_string(),
                depending: dependent.depending.clone(),
                dependency: dependency.to_string(),
                sequence: dependent.sequence,
            });
        }
        dependent.kinds.len()
    }

    /// Every stored relation addressed to `user`, in key order.
    pub fn relations_for(&self, user: &str) -> Result<Vec<Relation>> {
        let mut relations = Vec::new();
        for item in self.store.scan_prefix(maintains_prefix(user).as_bytes()) {
            let (_, value) = item?;
            let maintained: MaintainedRecord = decode("maintainer record", &value)?;
            if !maintained.active {
                continue;
            }
            for dependent in self.dependents_of(&maintained.package)? {
                for kind in &dependent.kinds {
                    relations.push(Relation {
                        kind: *kind,
                        user: user.to_string(),
                        depending: dependent.depending.clone(),
                        dependency: maintained.package.clone(),
                        sequence: dependent.sequence,
                    });
                }
            }
        }
        Ok(relations)
    }
}

fn kinds_in(record: &PackageRecord, dependency: &str) -> Vec<RelationKind> {
    let mut kinds = Vec::new();
    if record.dependencies.contains(dependency) {
        kinds.push(RelationKind::Dependency);
    }
    if record.dev_dependencies.contains(dependency) {
        kinds.push(RelationKind::DevDependency);
    }
    kinds
}

impl FactScanner for RelationScanner {
    fn current_sequence(&self) -> Option<Sequence> {
        *self.position.read()
    }

    fn emit_events_for(&self, identity: &str) -> Result<usize> {
        let relations = self.relations_for(identity)?;
        for relation in &relations {
            self.bus.publish_relation(relation);
        }
        Ok(relations.len())
    }
}
