//! The model contract.
//!
//! A type becomes queryable by implementing [`Model`], whose only required
//! method returns the model's [`Definitions`]: table name, model name, and an
//! ordered list of field descriptors with their accessors. Definitions are
//! built once, when the model is registered, and cached in its
//! [`ModelMeta`](crate::registry::ModelMeta).
//!
//! # Examples
//!
//! ```
//! use quarry_db::model::{Definitions, Model};
//! use quarry_db::related::ForeignKey;
//!
//! #[derive(Debug, Clone, Default)]
//! struct User {
//!     id: i64,
//!     name: String,
//! }
//!
//! impl Model for User {
//!     fn definitions() -> Definitions<Self> {
//!         Definitions::<Self>::new("User", "users")
//!             .field("ID", |u| &u.id, |u| &mut u.id)
//!             .primary_key()
//!             .field("Name", |u| &u.name, |u| &mut u.name)
//!     }
//! }
//!
//! #[derive(Debug, Clone, Default)]
//! struct Todo {
//!     id: i64,
//!     title: String,
//!     user: ForeignKey<User>,
//! }
//!
//! impl Model for Todo {
//!     fn definitions() -> Definitions<Self> {
//!         Definitions::<Self>::new("Todo", "todos")
//!             .field("ID", |t| &t.id, |t| &mut t.id)
//!             .primary_key()
//!             .field("Title", |t| &t.title, |t| &mut t.title)
//!             .foreign_key("User", |t| &t.user, |t| &mut t.user)
//!             .nullable()
//!     }
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;
use quarry_core::{QuarryError, QuarryResult};

use crate::fields::{default_column, Access, AnyModel, FieldDef, FieldType, ValueType};
use crate::query::QuerySet;
use crate::registry::Registry;
use crate::related::{ForeignKey, RelatedSlot, RelationScope};
use crate::relation::{ModelKey, Relation, RelationTarget, RelationType, Through};
use crate::value::Value;

/// A registration hook run for every model a definition refers to.
pub(crate) type RegisterHook = fn(&Registry) -> QuarryResult<()>;

/// A queryable model type.
pub trait Model: Any + Send + Sync + Clone + Default + fmt::Debug {
    /// Returns the model's field definitions.
    fn definitions() -> Definitions<Self>;

    /// Runs before the model is written by `create` or `update_object`.
    fn before_save(&mut self) -> QuarryResult<()> {
        Ok(())
    }

    /// Runs after the model was written by `create` or `update_object`.
    fn after_save(&mut self) -> QuarryResult<()> {
        Ok(())
    }

    /// Returns a [`QuerySet`] over this model using the global registry.
    fn objects() -> QuerySet<Self> {
        QuerySet::new()
    }
}

fn register_hook<T: Model>(registry: &Registry) -> QuarryResult<()> {
    registry.register_model::<T>().map(drop)
}

fn wrong_model<M>() -> QuarryError {
    QuarryError::type_mismatch(std::any::type_name::<M>(), "another model type")
}

/// The field definitions of a model, built with a fluent API.
///
/// Modifier methods ([`primary_key`](Self::primary_key),
/// [`column`](Self::column), [`nullable`](Self::nullable),
/// [`read_only`](Self::read_only), [`related_name`](Self::related_name),
/// [`deferred`](Self::deferred)) apply to the most recently added field.
pub struct Definitions<M> {
    model_name: String,
    table: String,
    fields: Vec<FieldDef>,
    pub(crate) hooks: Vec<RegisterHook>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Definitions<M> {
    /// Starts the definitions of model `model_name` stored in `table`.
    pub fn new(model_name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            table: table.into(),
            fields: Vec::new(),
            hooks: Vec::new(),
            _model: PhantomData,
        }
    }

    /// The model name (also its content-type key).
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// The table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The fields in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub(crate) fn into_parts(self) -> (String, String, Vec<FieldDef>, Vec<RegisterHook>) {
        (self.model_name, self.table, self.fields, self.hooks)
    }

    /// Adds a column-backed field stored as `T`.
    ///
    /// The column kind and nullability are inferred from `T`; the column
    /// name defaults to the snake-cased field name.
    pub fn field<T: ValueType>(mut self, name: &str, get: fn(&M) -> &T, get_mut: fn(&mut M) -> &mut T) -> Self {
        let mut field = FieldDef::new(name, Some(default_column(name)), T::FIELD_TYPE);
        field.set_nullable(T::NULLABLE);
        field.access = Access {
            get: Some(Arc::new(move |obj: &dyn Any| {
                obj.downcast_ref::<M>().map(|m| get(m).clone().into())
            })),
            set: Some(Arc::new(move |obj: &mut dyn Any, value: &Value| -> QuarryResult<()> {
                let model = obj.downcast_mut::<M>().ok_or_else(wrong_model::<M>)?;
                *get_mut(model) = T::from_value(value)?;
                Ok(())
            })),
            attach: None,
            bind: None,
        };
        self.fields.push(field);
        self
    }

    /// Adds a many-to-one relation to `T`, stored as a [`ForeignKey`].
    ///
    /// The column defaults to the snake-cased field name with an `_id`
    /// suffix.
    pub fn foreign_key<T: Model>(
        self,
        name: &str,
        get: fn(&M) -> &ForeignKey<T>,
        get_mut: fn(&mut M) -> &mut ForeignKey<T>,
    ) -> Self {
        self.to_one(RelationType::ManyToOne, name, get, get_mut)
    }

    /// Adds a one-to-one relation to `T`, stored as a [`ForeignKey`].
    pub fn one_to_one<T: Model>(
        self,
        name: &str,
        get: fn(&M) -> &ForeignKey<T>,
        get_mut: fn(&mut M) -> &mut ForeignKey<T>,
    ) -> Self {
        self.to_one(RelationType::OneToOne, name, get, get_mut)
    }

    fn to_one<T: Model>(
        mut self,
        kind: RelationType,
        name: &str,
        get: fn(&M) -> &ForeignKey<T>,
        get_mut: fn(&mut M) -> &mut ForeignKey<T>,
    ) -> Self {
        let mut field = FieldDef::new(name, Some(format!("{}_id", default_column(name))), FieldType::Relation);
        field.set_relation(Relation::forward(
            kind,
            ModelKey::of::<M>(),
            name,
            RelationTarget::Resolved(ModelKey::of::<T>()),
        ));
        field.access = Access {
            get: Some(Arc::new(move |obj: &dyn Any| {
                obj.downcast_ref::<M>().map(|m| get(m).id().clone())
            })),
            set: Some(Arc::new(move |obj: &mut dyn Any, value: &Value| -> QuarryResult<()> {
                let model = obj.downcast_mut::<M>().ok_or_else(wrong_model::<M>)?;
                get_mut(model).set_id(value.clone());
                Ok(())
            })),
            attach: Some(slot_attach::<M, ForeignKey<T>>(get_mut)),
            bind: Some(slot_bind::<M, ForeignKey<T>>(get_mut)),
        };
        self.fields.push(field);
        self.hooks.push(register_hook::<T>);
        self
    }

    /// Adds a many-to-many relation through the model `Th`.
    ///
    /// The target model is the container's target. `source_field` and
    /// `target_field` name the foreign keys on `Th` pointing at `M` and at
    /// the target respectively. The field has no column; its
    /// storage is a container such as [`RelM2M`](crate::related::RelM2M).
    pub fn many_to_many<Th: Model, C: RelatedSlot>(
        self,
        name: &str,
        source_field: &str,
        target_field: &str,
        get_mut: fn(&mut M) -> &mut C,
    ) -> Self {
        self.through_relation::<Th, C>(RelationType::ManyToMany, name, source_field, target_field, get_mut)
    }

    /// Adds a one-to-one relation mediated by the model `Th`.
    pub fn one_to_one_through<Th: Model, C: RelatedSlot>(
        self,
        name: &str,
        source_field: &str,
        target_field: &str,
        get_mut: fn(&mut M) -> &mut C,
    ) -> Self {
        self.through_relation::<Th, C>(RelationType::OneToOne, name, source_field, target_field, get_mut)
    }

    fn through_relation<Th: Model, C: RelatedSlot>(
        mut self,
        kind: RelationType,
        name: &str,
        source_field: &str,
        target_field: &str,
        get_mut: fn(&mut M) -> &mut C,
    ) -> Self {
        let mut field = FieldDef::new(name, None, FieldType::Relation);
        field.set_editable(false);
        field.set_relation(
            Relation::forward(
                kind,
                ModelKey::of::<M>(),
                name,
                RelationTarget::Resolved(ModelKey::of::<C::Target>()),
            )
            .with_through(Through::new(ModelKey::of::<Th>(), source_field, target_field)),
        );
        field.access = Access {
            get: None,
            set: None,
            attach: Some(slot_attach::<M, C>(get_mut)),
            bind: Some(slot_bind::<M, C>(get_mut)),
        };
        self.fields.push(field);
        self.hooks.push(register_hook::<C::Target>);
        self.hooks.push(register_hook::<Th>);
        self
    }

    /// Declares storage for a reverse relation derived by the registry.
    ///
    /// `name` must match the reverse alias (`{Source}Set` for to-many
    /// relations, `{Source}` for to-one relations, or the explicit related
    /// name). Objects selected through the reverse relation are collected
    /// into the container.
    pub fn reverse<C: RelatedSlot>(mut self, name: &str, get_mut: fn(&mut M) -> &mut C) -> Self {
        let mut field = FieldDef::new(name, None, FieldType::Relation);
        field.set_reverse_slot();
        field.access = Access {
            get: None,
            set: None,
            attach: Some(slot_attach::<M, C>(get_mut)),
            bind: Some(slot_bind::<M, C>(get_mut)),
        };
        self.fields.push(field);
        self
    }

    fn last_field(&mut self) -> Option<&mut FieldDef> {
        self.fields.last_mut()
    }

    /// Marks the last field as the primary key.
    pub fn primary_key(mut self) -> Self {
        if let Some(field) = self.last_field() {
            field.set_primary_key();
        }
        self
    }

    /// Overrides the column name of the last field.
    pub fn column(mut self, column: &str) -> Self {
        if let Some(field) = self.last_field() {
            field.set_column(column);
        }
        self
    }

    /// Marks the last field as nullable.
    pub fn nullable(mut self) -> Self {
        if let Some(field) = self.last_field() {
            field.set_nullable(true);
        }
        self
    }

    /// Excludes the last field from create and update statements.
    pub fn read_only(mut self) -> Self {
        if let Some(field) = self.last_field() {
            field.set_editable(false);
        }
        self
    }

    /// Sets the alias of the reverse relation derived from the last field.
    pub fn related_name(mut self, name: &str) -> Self {
        if let Some(relation) = self.last_field().and_then(FieldDef::relation_mut) {
            *relation = relation.clone().with_related_name(name);
        }
        self
    }

    /// Turns the last field into a relation whose target is named by
    /// content-type key.
    ///
    /// The field keeps its column and stores the target's primary key. The
    /// registry derives the reverse relation once a model named `key` is
    /// registered.
    pub fn deferred(mut self, kind: RelationType, key: &str) -> Self {
        if let Some(field) = self.last_field() {
            let relation = Relation::forward(
                kind,
                ModelKey::of::<M>(),
                field.name().to_string(),
                RelationTarget::Deferred(key.to_string()),
            );
            field.set_relation(relation);
        }
        self
    }
}

fn slot_attach<M: Model, C: RelatedSlot>(get_mut: fn(&mut M) -> &mut C) -> crate::fields::Attach {
    Arc::new(move |obj: &mut dyn Any, related: AnyModel, pk: &Value| -> QuarryResult<()> {
        let model = obj.downcast_mut::<M>().ok_or_else(wrong_model::<M>)?;
        let related = related
            .downcast::<C::Target>()
            .map_err(|_| wrong_model::<C::Target>())?;
        get_mut(model).attach(*related, pk);
        Ok(())
    })
}

fn slot_bind<M: Model, C: RelatedSlot>(get_mut: fn(&mut M) -> &mut C) -> crate::fields::Bind {
    Arc::new(move |obj: &mut dyn Any, scope: RelationScope| {
        if let Some(model) = obj.downcast_mut::<M>() {
            get_mut(model).bind(scope);
        }
    })
}

/// Primary-key fields by model type, taken from the definitions on first use.
static PK_FIELDS: Lazy<RwLock<HashMap<TypeId, Option<Arc<FieldDef>>>>> = Lazy::new(RwLock::default);

fn pk_field<M: Model>() -> Option<Arc<FieldDef>> {
    let id = TypeId::of::<M>();
    if let Some(field) = PK_FIELDS.read().unwrap_or_else(PoisonError::into_inner).get(&id) {
        return field.clone();
    }
    let field = M::definitions()
        .fields()
        .iter()
        .find(|f| f.is_primary_key())
        .cloned()
        .map(Arc::new);
    PK_FIELDS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(id)
        .or_insert(field)
        .clone()
}

/// Reads the primary key of a model instance.
///
/// Returns [`Value::Null`] for models without a primary key. Code holding
/// the model's [`ModelMeta`](crate::registry::ModelMeta) should prefer
/// [`ModelMeta::pk_of`](crate::registry::ModelMeta::pk_of).
pub fn pk_value<M: Model>(obj: &M) -> Value {
    pk_field::<M>()
        .and_then(|f| f.value_of(obj))
        .unwrap_or(Value::Null)
}

/// Compares two primary-key values.
pub(crate) fn same_key(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        _ => a.identity() == b.identity(),
    }
}
