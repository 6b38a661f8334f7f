//! Field descriptors.
//!
//! A [`FieldDef`] describes one field of a model: its name, column,
//! nullability, editability, primary-key flag and optional [`Relation`].
//! Each descriptor also carries the accessor closures built once by
//! [`Definitions`](crate::model::Definitions), which read and write the field
//! on a type-erased model instance. No per-access reflection happens after
//! registration.

pub mod types;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};

pub use types::{FieldType, ValueType};

use crate::related::RelationScope;
use crate::relation::Relation;
use crate::value::Value;

/// A boxed, type-erased model instance.
pub type AnyModel = Box<dyn Any + Send + Sync>;

pub(crate) type Getter = Arc<dyn Fn(&dyn Any) -> Option<Value> + Send + Sync>;
pub(crate) type Setter = Arc<dyn Fn(&mut dyn Any, &Value) -> QuarryResult<()> + Send + Sync>;
pub(crate) type Attach = Arc<dyn Fn(&mut dyn Any, AnyModel, &Value) -> QuarryResult<()> + Send + Sync>;
pub(crate) type Bind = Arc<dyn Fn(&mut dyn Any, RelationScope) + Send + Sync>;

/// Accessor closures for one field. Fields without storage leave them unset.
#[derive(Clone, Default)]
pub(crate) struct Access {
    pub(crate) get: Option<Getter>,
    pub(crate) set: Option<Setter>,
    pub(crate) attach: Option<Attach>,
    pub(crate) bind: Option<Bind>,
}

/// Describes a single model field.
#[derive(Clone)]
pub struct FieldDef {
    name: String,
    column: Option<String>,
    field_type: FieldType,
    primary_key: bool,
    null: bool,
    editable: bool,
    relation: Option<Relation>,
    reverse_slot: bool,
    pub(crate) access: Access,
}

impl FieldDef {
    pub(crate) fn new(name: impl Into<String>, column: Option<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            column,
            field_type,
            primary_key: false,
            null: false,
            editable: true,
            relation: None,
            reverse_slot: false,
            access: Access::default(),
        }
    }

    /// A descriptor for a reverse relation that has no storage on the model.
    pub(crate) fn virtual_relation(relation: Relation) -> Self {
        let mut field = Self::new(relation.name().to_string(), None, FieldType::Relation);
        field.editable = false;
        field.relation = Some(relation);
        field
    }

    /// The field name used in paths.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The column name, or `None` for fields with no column of their own.
    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    /// The column kind.
    pub const fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Whether this is the primary key.
    pub const fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    /// Whether the column accepts NULL.
    pub const fn is_nullable(&self) -> bool {
        self.null
    }

    /// Whether the field is written by create and update.
    pub const fn is_editable(&self) -> bool {
        self.editable
    }

    /// The forward relation declared on this field.
    pub const fn relation(&self) -> Option<&Relation> {
        self.relation.as_ref()
    }

    /// Whether this field stores a reverse relation derived by the registry.
    pub const fn is_reverse_slot(&self) -> bool {
        self.reverse_slot
    }

    /// Whether the field maps to a column of the model's table.
    pub const fn is_concrete(&self) -> bool {
        self.column.is_some()
    }

    /// Reads the field from a model instance.
    pub fn value_of(&self, obj: &dyn Any) -> Option<Value> {
        self.access.get.as_ref().and_then(|get| get(obj))
    }

    /// Writes a scanned value into a model instance.
    pub fn set_value(&self, obj: &mut dyn Any, value: &Value) -> QuarryResult<()> {
        match &self.access.set {
            Some(set) => set(obj, value).map_err(|e| e.with_field(&self.name)),
            None => Err(QuarryError::NotImplemented(format!(
                "field `{}` cannot be assigned",
                self.name
            ))),
        }
    }

    /// Stores a materialized related object in this field.
    pub(crate) fn attach(&self, obj: &mut dyn Any, related: AnyModel, pk: &Value) -> QuarryResult<()> {
        match &self.access.attach {
            Some(attach) => attach(obj, related, pk),
            None => Err(QuarryError::NotImplemented(format!(
                "field `{}` cannot hold related objects",
                self.name
            ))),
        }
    }

    /// Binds the relation container stored in this field to its parent.
    pub(crate) fn bind(&self, obj: &mut dyn Any, scope: RelationScope) {
        if let Some(bind) = &self.access.bind {
            bind(obj, scope);
        }
    }

    pub(crate) const fn has_slot(&self) -> bool {
        self.access.attach.is_some()
    }

    pub(crate) fn set_column(&mut self, column: impl Into<String>) {
        self.column = Some(column.into());
    }

    pub(crate) fn set_primary_key(&mut self) {
        self.primary_key = true;
        self.null = false;
    }

    pub(crate) fn set_nullable(&mut self, null: bool) {
        self.null = null;
    }

    pub(crate) fn set_editable(&mut self, editable: bool) {
        self.editable = editable;
    }

    pub(crate) fn set_relation(&mut self, relation: Relation) {
        self.relation = Some(relation);
    }

    pub(crate) fn relation_mut(&mut self) -> Option<&mut Relation> {
        self.relation.as_mut()
    }

    pub(crate) fn set_reverse_slot(&mut self) {
        self.reverse_slot = true;
        self.editable = false;
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("field_type", &self.field_type)
            .field("primary_key", &self.primary_key)
            .field("null", &self.null)
            .field("editable", &self.editable)
            .field("relation", &self.relation)
            .field("reverse_slot", &self.reverse_slot)
            .finish_non_exhaustive()
    }
}

/// Converts a field name to its default column name.
///
/// `"CreatedAt"` becomes `"created_at"`, `"ID"` becomes `"id"` and
/// `"HTTPStatus"` becomes `"http_status"`.
pub fn default_column(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}
