//! Relation containers.
//!
//! Relation fields do not hold bare keys. A forward to-one relation is stored
//! as a [`ForeignKey`], which keeps the target's primary key and, when the
//! target was selected, the loaded object. Reverse and through-mediated
//! relations are stored in containers ([`RelRevFK`], [`RelM2M`],
//! [`RelO2O`]) holding a cache of the related objects that were selected
//! with the parent, plus a [`RelationScope`] from which a scoped
//! [`QuerySet`] can be built at any time.
//!
//! Containers are bound to their parent when the parent is loaded or created.
//! An unbound container has nothing to scope its queries to, so its
//! [`objects`](RelRevFK::objects) query set fails with a configuration error.
//!
//! A container inherits the [`QueryContext`] of the query that loaded or
//! created its parent; its reads and link writes run under that context
//! unless [`set_context`](RelM2M::set_context) replaces it.

use std::fmt;
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};

use crate::context::QueryContext;
use crate::executor::DbExecutor;
use crate::model::{pk_value, same_key, Model};
use crate::query::compiler::{quote, CompiledQuery, DatabaseBackendType};
use crate::query::QuerySet;
use crate::registry::{ModelMeta, Registry};
use crate::relation::Relation;
use crate::transactions::run_in_transaction;
use crate::value::Value;

/// Where a relation container points: the registry, the parent's primary
/// key, the relation seen from the parent and the context its queries run
/// under.
#[derive(Debug, Clone)]
pub struct RelationScope {
    pub(crate) registry: Registry,
    pub(crate) parent_pk: Value,
    pub(crate) relation: Relation,
    pub(crate) context: QueryContext,
}

impl RelationScope {
    pub(crate) fn new(registry: Registry, parent_pk: Value, relation: Relation) -> Self {
        Self {
            registry,
            parent_pk,
            relation,
            context: QueryContext::default(),
        }
    }

    /// The context the container's queries run under.
    pub const fn context(&self) -> &QueryContext {
        &self.context
    }

    /// The primary key of the object owning the container.
    pub fn parent_pk(&self) -> &Value {
        &self.parent_pk
    }

    /// The relation from the owning object to the container's targets.
    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    fn through_link(&self) -> QuarryResult<ThroughLink> {
        let through = self.relation.through().ok_or_else(|| {
            QuarryError::NotImplemented(format!(
                "relation {} has no through model to write links to",
                self.relation.name()
            ))
        })?;
        let meta = self.registry.meta(through.model()).ok_or_else(|| {
            QuarryError::ConfigurationError(format!(
                "through model of relation {} is not registered",
                self.relation.name()
            ))
        })?;
        let column = |name: &str| -> QuarryResult<String> {
            meta.field(name)
                .and_then(|f| f.column())
                .map(str::to_string)
                .ok_or_else(|| {
                    QuarryError::ConfigurationError(format!(
                        "through model {} has no foreign key {name}",
                        meta.model_name()
                    ))
                })
        };
        let source = column(through.source_field())?;
        let target = column(through.target_field())?;
        if self.parent_pk.is_unset_key() {
            return Err(QuarryError::DatabaseError(
                "cannot link objects to an unsaved parent".to_string(),
            ));
        }
        Ok(ThroughLink {
            meta,
            source,
            target,
            parent: self.parent_pk.clone(),
        })
    }
}

/// The columns of a through model linking a parent to its targets.
struct ThroughLink {
    meta: Arc<ModelMeta>,
    source: String,
    target: String,
    parent: Value,
}

impl ThroughLink {
    /// Inserts the link unless it exists, in one statement. Affects one row
    /// when the link was added and none otherwise.
    fn insert_missing(&self, target: &Value, backend: DatabaseBackendType) -> CompiledQuery {
        let table = quote(self.meta.table());
        let (source, target_column) = (quote(&self.source), quote(&self.target));
        let from = match backend {
            DatabaseBackendType::MySQL => " FROM DUAL",
            DatabaseBackendType::SQLite | DatabaseBackendType::PostgreSQL => "",
        };
        CompiledQuery::new(
            format!(
                "INSERT INTO {table} ({source}, {target_column}) SELECT ?, ?{from} WHERE NOT EXISTS \
                 (SELECT 1 FROM {table} WHERE {source} = ? AND {target_column} = ?)"
            ),
            vec![self.parent.clone(), target.clone(), self.parent.clone(), target.clone()],
        )
    }

    fn insert(&self, target: &Value) -> CompiledQuery {
        CompiledQuery::new(
            format!(
                "INSERT INTO {} ({}, {}) VALUES (?, ?)",
                quote(self.meta.table()),
                quote(&self.source),
                quote(&self.target)
            ),
            vec![self.parent.clone(), target.clone()],
        )
    }

    fn delete(&self, target: Option<&Value>) -> CompiledQuery {
        let mut sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote(self.meta.table()),
            quote(&self.source)
        );
        let mut params = vec![self.parent.clone()];
        if let Some(target) = target {
            sql.push_str(&format!(" AND {} = ?", quote(&self.target)));
            params.push(target.clone());
        }
        CompiledQuery::new(sql, params)
    }
}

fn saved_key<T: Model>(obj: &T) -> QuarryResult<Value> {
    let pk = pk_value(obj);
    if pk.is_unset_key() {
        return Err(QuarryError::DatabaseError(format!(
            "{} must be saved before it can be linked",
            std::any::type_name::<T>()
        )));
    }
    Ok(pk)
}

fn unbound<T: Model>() -> QuerySet<T> {
    QuerySet::failed(
        Registry::global(),
        QuarryError::ConfigurationError(format!(
            "relation container of {} is not bound to a saved object",
            std::any::type_name::<T>()
        )),
    )
}

/// Storage for the objects of one relation, filled while scanning rows.
pub trait RelatedSlot: Default + Send + Sync + 'static {
    /// The related model.
    type Target: Model;

    /// Adds a related object materialized from a joined row.
    fn attach(&mut self, obj: Self::Target, pk: &Value);

    /// Binds the slot to its parent object.
    fn bind(&mut self, scope: RelationScope);
}

/// A cached list of related objects, deduplicated by primary key.
struct Cache<T> {
    objects: Option<Vec<T>>,
    keys: Vec<Value>,
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self {
            objects: None,
            keys: Vec::new(),
        }
    }
}

impl<T: Clone> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            objects: self.objects.clone(),
            keys: self.keys.clone(),
        }
    }
}

impl<T: Model> Cache<T> {
    fn push(&mut self, obj: T, pk: &Value) {
        if self.keys.iter().any(|k| same_key(k, pk)) {
            return;
        }
        self.keys.push(pk.clone());
        self.objects.get_or_insert_with(Vec::new).push(obj);
    }

    fn replace(&mut self, objects: Vec<T>) {
        self.keys = objects.iter().map(pk_value).collect();
        self.objects = Some(objects);
    }

    fn remove(&mut self, pk: &Value) {
        if let Some(pos) = self.keys.iter().position(|k| same_key(k, pk)) {
            self.keys.remove(pos);
            if let Some(objects) = self.objects.as_mut() {
                objects.remove(pos);
            }
        }
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.objects = Some(Vec::new());
    }

    fn as_slice(&self) -> &[T] {
        self.objects.as_deref().unwrap_or_default()
    }
}

macro_rules! container_common {
    ($name:ident) => {
        impl<T: Model> Default for $name<T> {
            fn default() -> Self {
                Self {
                    scope: None,
                    cache: Cache::default(),
                }
            }
        }

        impl<T: Model> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self {
                    scope: self.scope.clone(),
                    cache: self.cache.clone(),
                }
            }
        }

        impl<T: Model> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bound", &self.scope.is_some())
                    .field("objects", &self.cache.objects)
                    .finish()
            }
        }

        impl<T: Model + PartialEq> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.as_list() == other.as_list()
            }
        }

        impl<T: Model> RelatedSlot for $name<T> {
            type Target = T;

            fn attach(&mut self, obj: T, pk: &Value) {
                self.cache.push(obj, pk);
            }

            fn bind(&mut self, scope: RelationScope) {
                self.scope = Some(scope);
            }
        }

        impl<T: Model> $name<T> {
            /// The related objects selected with the parent, or loaded with
            /// [`load`](Self::load). Empty until either happened.
            pub fn as_list(&self) -> &[T] {
                self.cache.as_slice()
            }

            /// Returns `true` once the cache holds a result.
            pub const fn is_loaded(&self) -> bool {
                self.cache.objects.is_some()
            }

            /// The scope the container is bound to.
            pub const fn scope(&self) -> Option<&RelationScope> {
                self.scope.as_ref()
            }

            /// Replaces the context the container's queries run under.
            ///
            /// Has no effect on an unbound container.
            pub fn set_context(&mut self, context: QueryContext) {
                if let Some(scope) = self.scope.as_mut() {
                    scope.context = context;
                }
            }

            /// A query set over the related objects of the parent.
            pub fn objects(&self) -> QuerySet<T> {
                match &self.scope {
                    Some(scope) => QuerySet::for_relation(scope),
                    None => unbound::<T>(),
                }
            }

            /// Loads every related object into the cache.
            pub async fn load(&mut self, db: &dyn DbExecutor) -> QuarryResult<&[T]> {
                let objects = self.objects().all(db).await?;
                self.cache.replace(objects);
                Ok(self.cache.as_slice())
            }
        }
    };
}

/// The objects pointing at the parent through a foreign key.
pub struct RelRevFK<T: Model> {
    scope: Option<RelationScope>,
    cache: Cache<T>,
}

container_common!(RelRevFK);

impl<T: Model> RelRevFK<T> {
    /// The number of cached objects.
    pub fn len(&self) -> usize {
        self.as_list().len()
    }

    /// Returns `true` if no objects are cached.
    pub fn is_empty(&self) -> bool {
        self.as_list().is_empty()
    }
}

/// The objects linked to the parent through a many-to-many relation.
pub struct RelM2M<T: Model> {
    scope: Option<RelationScope>,
    cache: Cache<T>,
}

container_common!(RelM2M);

impl<T: Model> RelM2M<T> {
    /// The number of cached objects.
    pub fn len(&self) -> usize {
        self.as_list().len()
    }

    /// Returns `true` if no objects are cached.
    pub fn is_empty(&self) -> bool {
        self.as_list().is_empty()
    }

    fn link(&self) -> QuarryResult<ThroughLink> {
        self.scope
            .as_ref()
            .ok_or_else(|| {
                QuarryError::ConfigurationError(
                    "relation container is not bound to a saved object".to_string(),
                )
            })?
            .through_link()
    }

    /// Links `target` to the parent by writing a through-model row.
    ///
    /// Returns `false` if the link already existed. The check and the write
    /// are one statement, so concurrent adds of the same pair write one row.
    pub async fn add_target(&mut self, target: &T, db: &dyn DbExecutor) -> QuarryResult<bool> {
        let link = self.link()?;
        let key = saved_key(target)?;
        let backend = db.backend_type();
        let qs = self.objects();
        let q = qs.record(link.insert_missing(&key, backend), backend);
        let added = qs.run("add_target", db.execute_sql(&q.sql, &q.params)).await? > 0;
        if added {
            tracing::debug!(table = %link.meta.table(), "added through link");
        }
        if self.is_loaded() {
            self.cache.push(target.clone(), &key);
        }
        Ok(added)
    }

    /// Removes the link between the parent and `target`.
    ///
    /// Returns `false` if there was no link to remove.
    pub async fn remove_target(&mut self, target: &T, db: &dyn DbExecutor) -> QuarryResult<bool> {
        let link = self.link()?;
        let key = saved_key(target)?;
        let backend = db.backend_type();
        let qs = self.objects();
        let q = qs.record(link.delete(Some(&key)), backend);
        let removed = qs.run("remove_target", db.execute_sql(&q.sql, &q.params)).await?;
        self.cache.remove(&key);
        Ok(removed > 0)
    }

    /// Removes every link of the parent, returning how many were removed.
    pub async fn clear_targets(&mut self, db: &dyn DbExecutor) -> QuarryResult<u64> {
        let link = self.link()?;
        let backend = db.backend_type();
        let qs = self.objects();
        let q = qs.record(link.delete(None), backend);
        let removed = qs.run("clear_targets", db.execute_sql(&q.sql, &q.params)).await?;
        tracing::debug!(table = %link.meta.table(), removed, "cleared through links");
        self.cache.clear();
        Ok(removed)
    }
}

/// The object paired with the parent through a one-to-one relation seen
/// from its reverse side, or mediated by a through model.
pub struct RelO2O<T: Model> {
    scope: Option<RelationScope>,
    cache: Cache<T>,
}

container_common!(RelO2O);

impl<T: Model> RelO2O<T> {
    /// The paired object, if it was selected or loaded.
    pub fn get(&self) -> Option<&T> {
        self.as_list().first()
    }

    /// Pairs `target` with the parent, replacing any previous pairing.
    ///
    /// The old link is removed and the new one written in one transaction
    /// (a savepoint when `db` is already a transaction). Only
    /// through-mediated relations can be written; the reverse side of a
    /// plain one-to-one is owned by the target's foreign key.
    pub async fn set_target(&mut self, target: &T, db: &dyn DbExecutor) -> QuarryResult<()> {
        let scope = self.scope.as_ref().ok_or_else(|| {
            QuarryError::ConfigurationError("relation container is not bound to a saved object".to_string())
        })?;
        if scope.relation().through().is_none() {
            return Err(QuarryError::NotImplemented(format!(
                "relation {} is written through the foreign key on its target",
                scope.relation().name()
            )));
        }
        let link = scope.through_link()?;
        let key = saved_key(target)?;
        let backend = db.backend_type();
        let qs = self.objects();
        let clear = qs.record(link.delete(None), backend);
        let insert = qs.record(link.insert(&key), backend);
        run_in_transaction(db, |txn| async move {
            qs.run("set_target", txn.execute_sql(&clear.sql, &clear.params)).await?;
            qs.run("set_target", txn.execute_sql(&insert.sql, &insert.params)).await?;
            Ok(true)
        })
        .await?;
        self.cache.replace(vec![target.clone()]);
        Ok(())
    }
}

/// A forward to-one relation: the target's primary key plus the target
/// itself once it was selected or fetched.
pub struct ForeignKey<T> {
    id: Value,
    object: Option<Box<T>>,
    registry: Option<Registry>,
    context: QueryContext,
}

impl<T> Default for ForeignKey<T> {
    fn default() -> Self {
        Self {
            id: Value::Null,
            object: None,
            registry: None,
            context: QueryContext::default(),
        }
    }
}

impl<T: Clone> Clone for ForeignKey<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            object: self.object.clone(),
            registry: self.registry.clone(),
            context: self.context.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ForeignKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignKey")
            .field("id", &self.id)
            .field("object", &self.object)
            .finish()
    }
}

impl<T> PartialEq for ForeignKey<T> {
    fn eq(&self, other: &Self) -> bool {
        same_key(&self.id, &other.id)
    }
}

impl<T: Model> ForeignKey<T> {
    /// A foreign key to the object with primary key `id`.
    pub fn new(id: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// A foreign key to a loaded object.
    pub fn to(obj: T) -> Self {
        let mut fk = Self::default();
        fk.set(obj);
        fk
    }

    /// The target's primary key, `Null` when unset.
    pub const fn id(&self) -> &Value {
        &self.id
    }

    /// Returns `true` if the key is unset.
    pub const fn is_null(&self) -> bool {
        self.id.is_null()
    }

    /// The loaded target, if any.
    pub fn get(&self) -> Option<&T> {
        self.object.as_deref()
    }

    /// Points the key at `obj` and keeps the object.
    pub fn set(&mut self, obj: T) {
        self.id = pk_value(&obj);
        self.object = Some(Box::new(obj));
    }

    /// Points the key at another primary key, dropping a loaded target
    /// that no longer matches.
    pub fn set_id(&mut self, id: impl Into<Value>) {
        let id = id.into();
        if !same_key(&self.id, &id) {
            self.object = None;
        }
        self.id = id;
    }

    /// Loads the target if it is not loaded yet.
    ///
    /// Returns `None` for a null key.
    pub async fn fetch(&mut self, db: &dyn DbExecutor) -> QuarryResult<Option<&T>> {
        if self.id.is_null() {
            return Ok(None);
        }
        if self.object.is_none() {
            let registry = self.registry.clone().unwrap_or_else(Registry::global);
            let obj = QuerySet::<T>::with_registry(&registry)
                .with_context(self.context.clone())
                .filter_pk(self.id.clone())
                .get(db)
                .await?;
            self.object = Some(Box::new(obj));
        }
        Ok(self.object.as_deref())
    }
}

impl<T: Model> RelatedSlot for ForeignKey<T> {
    type Target = T;

    fn attach(&mut self, obj: T, pk: &Value) {
        self.id = pk.clone();
        self.object = Some(Box::new(obj));
    }

    fn bind(&mut self, scope: RelationScope) {
        self.registry = Some(scope.registry);
        self.context = scope.context;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDb, Tag, Todo, User};

    fn bound_tags(registry: &Registry, todo_id: i64) -> RelM2M<Tag> {
        let meta = registry.register_model::<Todo>().unwrap();
        let relation = meta.forward("Tags").unwrap().clone();
        let mut tags = RelM2M::<Tag>::default();
        tags.bind(RelationScope::new(registry.clone(), Value::Int(todo_id), relation));
        tags
    }

    fn tag(id: i64, name: &str) -> Tag {
        Tag {
            id,
            name: name.to_string(),
            ..Tag::default()
        }
    }

    #[test]
    fn test_attach_deduplicates() {
        let mut tags = RelM2M::<Tag>::default();
        tags.attach(tag(1, "a"), &Value::Int(1));
        tags.attach(tag(1, "a"), &Value::Int(1));
        tags.attach(tag(2, "b"), &Value::Int(2));
        assert_eq!(tags.len(), 2);
        assert!(tags.is_loaded());
    }

    #[test]
    fn test_unbound_objects_fails() {
        let tags = RelM2M::<Tag>::default();
        assert!(tags.objects().sql(DatabaseBackendType::SQLite).unwrap_err().is_configuration());
    }

    #[test]
    fn test_foreign_key_set_id_drops_stale_object() {
        let user = User {
            id: 3,
            name: "Ann".into(),
            ..User::default()
        };
        let mut fk = ForeignKey::to(user);
        assert_eq!(fk.id(), &Value::Int(3));
        fk.set_id(3);
        assert!(fk.get().is_some());
        fk.set_id(4);
        assert!(fk.get().is_none());
        assert_eq!(fk, ForeignKey::new(4));
    }

    #[tokio::test]
    async fn test_add_target_is_one_conditional_insert() {
        let registry = Registry::new();
        let mut tags = bound_tags(&registry, 7);
        let db = MockDb::new(DatabaseBackendType::SQLite);

        assert!(tags.add_target(&tag(2, "b"), &db).await.unwrap());

        let stmts = db.statements().await;
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].0,
            concat!(
                r#"INSERT INTO "todo_tags" ("todo_id", "tag_id") SELECT ?, ? WHERE NOT EXISTS "#,
                r#"(SELECT 1 FROM "todo_tags" WHERE "todo_id" = ? AND "tag_id" = ?)"#
            )
        );
        assert_eq!(
            stmts[0].1,
            vec![Value::Int(7), Value::Int(2), Value::Int(7), Value::Int(2)]
        );
    }

    #[tokio::test]
    async fn test_link_writes_run_under_the_bound_context() {
        let registry = Registry::new();
        let mut tags = bound_tags(&registry, 7);
        let (ctx, handle) = QueryContext::cancellable();
        tags.set_context(ctx);
        assert!(!tags.scope().unwrap().context().is_cancelled());
        handle.cancel();

        let db = MockDb::new(DatabaseBackendType::SQLite);
        let err = tags.add_target(&tag(2, "b"), &db).await.unwrap_err();
        assert!(matches!(err, QuarryError::Cancelled(_)));
        let err = tags.clear_targets(&db).await.unwrap_err();
        assert!(matches!(err, QuarryError::Cancelled(_)));
        assert!(tags.objects().count(&db).await.is_err());
        assert!(db.statements().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_target_replaces_link_in_one_transaction() {
        let registry = Registry::new();
        let user = registry.register_model::<User>().unwrap();
        let mut avatar = RelO2O::<crate::testing::Image>::default();
        avatar.bind(RelationScope::new(
            registry.clone(),
            Value::Int(3),
            user.forward("Avatar").unwrap().clone(),
        ));
        let image = crate::testing::Image {
            id: 8,
            path: "a.png".into(),
        };
        let db = MockDb::new(DatabaseBackendType::SQLite);
        avatar.set_target(&image, &db).await.unwrap();

        let stmts = db.statements().await;
        let sql: Vec<&str> = stmts.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "BEGIN",
                r#"DELETE FROM "user_images" WHERE "user_id" = ?"#,
                r#"INSERT INTO "user_images" ("user_id", "image_id") VALUES (?, ?)"#,
                "COMMIT",
            ]
        );
        assert_eq!(avatar.get().map(|i| i.id), Some(8));
    }

    #[tokio::test]
    async fn test_clear_targets_postgres_placeholders() {
        let registry = Registry::new();
        let mut tags = bound_tags(&registry, 7);
        let db = MockDb::new(DatabaseBackendType::PostgreSQL);
        tags.clear_targets(&db).await.unwrap();
        let stmts = db.statements().await;
        assert_eq!(stmts[0].0, r#"DELETE FROM "todo_tags" WHERE "todo_id" = $1"#);
        assert!(tags.is_loaded());
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn test_add_unsaved_target_fails() {
        let registry = Registry::new();
        let mut tags = bound_tags(&registry, 7);
        let db = MockDb::new(DatabaseBackendType::SQLite);
        assert!(tags.add_target(&tag(0, "new"), &db).await.is_err());
        assert!(db.statements().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_target_on_plain_one_to_one_is_not_implemented() {
        let registry = Registry::new();
        registry.register_model::<crate::testing::Profile>().unwrap();
        let user = registry.get_model_meta::<User>().unwrap();
        let mut profile = RelO2O::<crate::testing::Profile>::default();
        profile.bind(RelationScope::new(registry.clone(), Value::Int(1), user.reverse("Profile").unwrap()));
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let err = profile
            .set_target(&crate::testing::Profile::default(), &db)
            .await
            .unwrap_err();
        assert!(matches!(err, QuarryError::NotImplemented(_)));
    }
}
