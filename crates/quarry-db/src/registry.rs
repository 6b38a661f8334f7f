//! The model meta registry.
//!
//! A [`Registry`] maps every registered model type to its [`ModelMeta`]: the
//! field descriptors built from [`Model::definitions`], the forward relations
//! declared on those fields and the reverse relations derived from other
//! models' forward relations.
//!
//! Registration is idempotent and recursive. Registering a model registers
//! every model its relations point at (and every through model) first; the
//! meta entry is staged before those targets are visited, so cycles and
//! self-references terminate.
//!
//! One thread registers at a time. Everything a registration stages (metas,
//! derived reverse relations, deferred relations) stays private to that
//! thread until the outermost call has linked every model, then becomes
//! visible at once. A failed registration publishes nothing.
//!
//! The registry is an explicit, cloneable handle. [`Registry::global`] is the
//! process-wide instance used by [`Model::objects`]; tests build isolated
//! registries with [`Registry::new`].
//!
//! # Examples
//!
//! ```ignore
//! let registry = Registry::new();
//! registry.register_model::<Todo>()?;
//!
//! // The forward relation Todo.User derives User.TodoSet.
//! let user = registry.get_model_meta::<User>().unwrap();
//! assert!(user.reverse("TodoSet").is_some());
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use quarry_core::{QuarryError, QuarryResult};

use crate::fields::{AnyModel, FieldDef};
use crate::model::Model;
use crate::relation::{ModelKey, Relation, RelationTarget};
use crate::value::Value;

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

fn instantiate<M: Model>() -> AnyModel {
    Box::new(M::default())
}

/// Registered metadata for one model type.
pub struct ModelMeta {
    key: ModelKey,
    model_name: String,
    table: String,
    fields: Vec<FieldDef>,
    pk: Option<usize>,
    forward: BTreeMap<String, Relation>,
    reverse: RwLock<BTreeMap<String, Relation>>,
    stored: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    factory: fn() -> AnyModel,
}

impl ModelMeta {
    /// The model's key.
    pub const fn key(&self) -> ModelKey {
        self.key
    }

    /// The model name, which doubles as its content-type key.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// The table the model is stored in.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Every declared field in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Looks up a declared field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// The primary-key field, if the model has one.
    pub fn primary_key(&self) -> Option<&FieldDef> {
        self.pk.map(|idx| &self.fields[idx])
    }

    /// The primary-key field, or a configuration error naming the model.
    pub fn require_pk(&self) -> QuarryResult<&FieldDef> {
        self.primary_key().ok_or_else(|| {
            QuarryError::ConfigurationError(format!("model {} has no primary key", self.model_name))
        })
    }

    /// Reads the primary key of `obj`, [`Value::Null`] for models without
    /// one.
    pub fn pk_of(&self, obj: &dyn Any) -> Value {
        self.primary_key()
            .and_then(|f| f.value_of(obj))
            .unwrap_or(Value::Null)
    }

    /// The primary-key column, or a configuration error.
    pub fn pk_column(&self) -> QuarryResult<&str> {
        let pk = self.require_pk()?;
        pk.column().ok_or_else(|| {
            QuarryError::ConfigurationError(format!(
                "primary key {}.{} has no column",
                self.model_name,
                pk.name()
            ))
        })
    }

    /// The forward relation declared on field `name`.
    pub fn forward(&self, name: &str) -> Option<&Relation> {
        self.forward.get(name)
    }

    /// Every forward relation, keyed by field name.
    pub fn forward_relations(&self) -> impl Iterator<Item = (&str, &Relation)> {
        self.forward.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The reverse relation registered under `alias`.
    pub fn reverse(&self, alias: &str) -> Option<Relation> {
        self.reverse
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned()
    }

    /// Every reverse relation, keyed by alias.
    pub fn reverse_relations(&self) -> Vec<(String, Relation)> {
        self.reverse
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Fields backed by a column of the model's table.
    pub fn concrete_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_concrete())
    }

    /// Every name a path segment may use on this model: declared fields
    /// followed by reverse aliases.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .fields
            .iter()
            .filter(|f| !f.is_reverse_slot())
            .map(|f| f.name().to_string())
            .collect();
        names.extend(
            self.reverse
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned(),
        );
        names
    }

    /// Stores an arbitrary value on the meta entry for surrounding layers.
    pub fn store<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.stored
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Arc::new(value));
    }

    /// Reads a value previously stored under `key`, if it has type `T`.
    pub fn stored<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self
            .stored
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        value.downcast::<T>().ok()
    }

    /// Creates a default instance of the model, type-erased.
    pub fn instantiate(&self) -> AnyModel {
        (self.factory)()
    }

    /// Checks that `relation` may be stored under `alias`. Returns `false`
    /// if the same relation is already stored there.
    fn check_reverse(&self, alias: &str, relation: &Relation) -> QuarryResult<bool> {
        if let Some(field) = self.field(alias) {
            if !field.is_reverse_slot() {
                return Err(QuarryError::ConfigurationError(format!(
                    "reverse relation {alias} collides with field {}.{alias}; set a related name",
                    self.model_name
                )));
            }
        }
        match self.reverse.read().unwrap_or_else(PoisonError::into_inner).get(alias) {
            Some(existing) if existing == relation => Ok(false),
            Some(_) => Err(self.duplicate_reverse(alias)),
            None => Ok(true),
        }
    }

    fn duplicate_reverse(&self, alias: &str) -> QuarryError {
        QuarryError::ConfigurationError(format!(
            "duplicate reverse relation {alias} on model {}; set a related name",
            self.model_name
        ))
    }

    fn put_reverse(&self, alias: String, relation: Relation) {
        self.reverse
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias, relation);
    }
}

impl fmt::Debug for ModelMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelMeta")
            .field("model_name", &self.model_name)
            .field("table", &self.table)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    models: HashMap<ModelKey, Arc<ModelMeta>>,
    by_name: HashMap<String, ModelKey>,
    pending: Vec<Relation>,
}

/// What the registration in progress has staged so far.
#[derive(Default)]
struct Batch {
    owner: Option<ThreadId>,
    depth: usize,
    models: HashMap<ModelKey, Arc<ModelMeta>>,
    by_name: HashMap<String, ModelKey>,
    reverses: Vec<(Arc<ModelMeta>, String, Relation)>,
    pending: Vec<Relation>,
}

#[derive(Default)]
struct Registration {
    batch: Mutex<Batch>,
    turn: Condvar,
}

impl Registration {
    fn lock(&self) -> MutexGuard<'_, Batch> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The calling thread's hold on the registration turn. Releasing the
/// outermost turn discards whatever was not published.
struct Turn<'a> {
    registration: &'a Registration,
    outermost: bool,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut batch = self.registration.lock();
        batch.depth = batch.depth.saturating_sub(1);
        if batch.depth == 0 {
            *batch = Batch::default();
            self.registration.turn.notify_all();
        }
    }
}

/// The model meta registry.
///
/// Cloning a `Registry` yields another handle to the same entries.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
    registration: Arc<Registration>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Registry")
            .field("models", &inner.models.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Returns `true` if both handles refer to the same registry.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers `M` and, recursively, every model reachable from it.
    ///
    /// Re-registering a model returns its existing meta without side effects.
    /// Concurrent callers wait for the registration in progress, so the meta
    /// they get back is always fully linked.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::ConfigurationError`] if the model declares no
    /// fields or several primary keys, if a derived reverse alias collides
    /// with another reverse relation or a declared field on the target, or if
    /// a through model lacks the fields the relation names. Nothing the
    /// failed call staged is published, including models its relations
    /// pulled in.
    pub fn register_model<M: Model>(&self) -> QuarryResult<Arc<ModelMeta>> {
        let key = ModelKey::of::<M>();
        if let Some(meta) = self.published(key) {
            return Ok(meta);
        }
        let turn = self.enter();
        if let Some(meta) = self.meta(key) {
            return Ok(meta);
        }

        let (model_name, table, fields, hooks) = M::definitions().into_parts();
        if fields.is_empty() {
            return Err(QuarryError::ConfigurationError(format!(
                "model {model_name} declares no fields"
            )));
        }
        let pks: Vec<usize> = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_primary_key())
            .map(|(i, _)| i)
            .collect();
        if pks.len() > 1 {
            return Err(QuarryError::ConfigurationError(format!(
                "model {model_name} declares {} primary keys",
                pks.len()
            )));
        }
        let forward = fields
            .iter()
            .filter(|f| !f.is_reverse_slot())
            .filter_map(|f| f.relation().map(|r| (f.name().to_string(), r.clone())))
            .collect();

        let meta = Arc::new(ModelMeta {
            key,
            model_name: model_name.clone(),
            table,
            fields,
            pk: pks.first().copied(),
            forward,
            reverse: RwLock::new(BTreeMap::new()),
            stored: RwLock::new(HashMap::new()),
            factory: instantiate::<M>,
        });

        {
            let mut batch = self.registration.lock();
            let taken = batch.by_name.contains_key(&model_name)
                || self
                    .inner
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .by_name
                    .contains_key(&model_name);
            if taken {
                return Err(QuarryError::ConfigurationError(format!(
                    "another model is already registered as {model_name}"
                )));
            }
            batch.models.insert(key, Arc::clone(&meta));
            batch.by_name.insert(model_name.clone(), key);
        }

        if let Err(e) = self.link(&meta, &hooks) {
            self.unstage(&meta);
            return Err(e);
        }
        if turn.outermost {
            self.publish();
        }

        tracing::debug!(
            model = %model_name,
            table = %meta.table(),
            relations = meta.forward.len(),
            "registered model"
        );
        Ok(meta)
    }

    /// Takes the registration turn, waiting while another thread holds it.
    /// The thread already holding the turn re-enters.
    fn enter(&self) -> Turn<'_> {
        let me = thread::current().id();
        let mut batch = self.registration.lock();
        while batch.owner.is_some_and(|owner| owner != me) {
            batch = self
                .registration
                .turn
                .wait(batch)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if batch.owner.is_none() {
            batch.owner = Some(me);
            batch.pending = self
                .inner
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .clone();
        }
        batch.depth += 1;
        Turn {
            registration: &self.registration,
            outermost: batch.depth == 1,
        }
    }

    /// Runs `f` over the staged batch if the calling thread holds the turn.
    fn staged<T>(&self, f: impl FnOnce(&Batch) -> Option<T>) -> Option<T> {
        let batch = self.registration.lock();
        if batch.owner == Some(thread::current().id()) {
            f(&batch)
        } else {
            None
        }
    }

    /// Makes everything staged visible in one step.
    fn publish(&self) {
        let mut batch = self.registration.lock();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let staged = batch.models.len();
        inner.models.extend(batch.models.drain());
        inner.by_name.extend(batch.by_name.drain());
        inner.pending = std::mem::take(&mut batch.pending);
        for (target, alias, relation) in batch.reverses.drain(..) {
            target.put_reverse(alias, relation);
        }
        tracing::trace!(models = staged, "published registration");
    }

    /// Drops a model whose linking failed, with the reverse relations and
    /// deferred relations staged for it.
    fn unstage(&self, meta: &ModelMeta) {
        let key = meta.key();
        let mut batch = self.registration.lock();
        batch.models.remove(&key);
        batch.by_name.remove(meta.model_name());
        batch
            .reverses
            .retain(|(target, _, relation)| target.key() != key && relation.model() != Some(key));
        batch.pending.retain(|r| r.from() != key);
    }

    /// Registers relation targets, then derives reverse relations for the
    /// new model's forward relations and for deferred relations waiting on it.
    fn link(&self, meta: &Arc<ModelMeta>, hooks: &[crate::model::RegisterHook]) -> QuarryResult<()> {
        for hook in hooks {
            hook(self)?;
        }

        let (mark, pending) = {
            let batch = self.registration.lock();
            (batch.reverses.len(), batch.pending.clone())
        };
        let result = self.derive_all(meta);
        if result.is_err() {
            let mut batch = self.registration.lock();
            batch.reverses.truncate(mark);
            batch.pending = pending;
        }
        result
    }

    fn derive_all(&self, meta: &Arc<ModelMeta>) -> QuarryResult<()> {
        for relation in meta.forward.values() {
            match self.resolve(relation) {
                Some(target) => self.derive_reverse(meta, &target, relation)?,
                None => match relation.target() {
                    RelationTarget::Deferred(name) => {
                        tracing::debug!(
                            model = %meta.model_name(),
                            field = %relation.name(),
                            target = %name,
                            "relation waiting for target model"
                        );
                        self.registration.lock().pending.push(relation.clone());
                    }
                    RelationTarget::Resolved(_) => {
                        return Err(QuarryError::UnknownRelation {
                            model: meta.model_name().to_string(),
                            name: relation.name().to_string(),
                        });
                    }
                },
            }
        }

        let waiting: Vec<Relation> = {
            let mut batch = self.registration.lock();
            let (matched, rest): (Vec<Relation>, Vec<Relation>) = std::mem::take(&mut batch.pending)
                .into_iter()
                .partition(|r| matches!(r.target(), RelationTarget::Deferred(n) if n == meta.model_name()));
            batch.pending = rest;
            matched
        };
        for relation in waiting {
            let source = self.meta(relation.from()).ok_or_else(|| QuarryError::UnknownRelation {
                model: meta.model_name().to_string(),
                name: relation.name().to_string(),
            })?;
            self.derive_reverse(&source, meta, &relation)?;
        }
        Ok(())
    }

    /// Derives the reverse of `relation` and stages it for `target`.
    fn derive_reverse(&self, source: &ModelMeta, target: &Arc<ModelMeta>, relation: &Relation) -> QuarryResult<()> {
        let inverse = relation.relation_type().inverse();
        let alias = relation.related_name().map_or_else(
            || {
                if inverse.is_to_many() {
                    format!("{}Set", source.model_name())
                } else {
                    source.model_name().to_string()
                }
            },
            str::to_string,
        );

        if let Some(through) = relation.through() {
            let through_meta = self.meta(through.model()).ok_or_else(|| {
                QuarryError::ConfigurationError(format!(
                    "through model of {}.{} is not registered",
                    source.model_name(),
                    relation.name()
                ))
            })?;
            for name in [through.source_field(), through.target_field()] {
                let ok = through_meta
                    .field(name)
                    .is_some_and(|f| f.is_concrete() && f.relation().is_some());
                if !ok {
                    return Err(QuarryError::ConfigurationError(format!(
                        "through model {} has no foreign key {name}",
                        through_meta.model_name()
                    )));
                }
            }
        }

        let reversed = relation.reversed(target.key(), alias.clone());
        if !target.check_reverse(&alias, &reversed)? {
            return Ok(());
        }
        let mut batch = self.registration.lock();
        let same = batch
            .reverses
            .iter()
            .find(|(t, a, _)| t.key() == target.key() && *a == alias)
            .map(|(_, _, existing)| *existing == reversed);
        match same {
            Some(true) => Ok(()),
            Some(false) => Err(target.duplicate_reverse(&alias)),
            None => {
                batch.reverses.push((Arc::clone(target), alias, reversed));
                Ok(())
            }
        }
    }

    /// Returns the meta of `M` if it is registered.
    pub fn get_model_meta<M: Model>(&self) -> Option<Arc<ModelMeta>> {
        self.meta(ModelKey::of::<M>())
    }

    /// Looks a meta entry up by key.
    pub fn meta(&self, key: ModelKey) -> Option<Arc<ModelMeta>> {
        self.published(key)
            .or_else(|| self.staged(|batch| batch.models.get(&key).cloned()))
    }

    fn published(&self, key: ModelKey) -> Option<Arc<ModelMeta>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .get(&key)
            .cloned()
    }

    /// Looks a meta entry up by model name.
    pub fn meta_by_name(&self, name: &str) -> Option<Arc<ModelMeta>> {
        let published = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner
                .by_name
                .get(name)
                .and_then(|key| inner.models.get(key))
                .cloned()
        };
        published.or_else(|| {
            self.staged(|batch| {
                batch
                    .by_name
                    .get(name)
                    .and_then(|key| batch.models.get(key))
                    .cloned()
            })
        })
    }

    /// Resolves the target of a relation to a registered model.
    ///
    /// Deferred targets resolve once a model with the named key is
    /// registered; until then `None` is returned.
    pub fn resolve(&self, relation: &Relation) -> Option<Arc<ModelMeta>> {
        match relation.target() {
            RelationTarget::Resolved(key) => self.meta(*key),
            RelationTarget::Deferred(name) => self.meta_by_name(name),
        }
    }

    /// Forward relations whose deferred target has not been registered yet.
    pub fn pending_relations(&self) -> Vec<Relation> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .clone()
    }
}
