//! Relation metadata.
//!
//! A [`Relation`] is a directed edge of the model graph. Forward relations
//! are declared on a field of the owning model; reverse relations are derived
//! by the [`Registry`](crate::registry::Registry) when the forward relation is
//! registered. Edges refer to models by [`ModelKey`] rather than holding
//! pointers to other metadata, so self-referential and cyclic graphs need no
//! special handling.

use std::any::TypeId;
use std::fmt;

/// Identifies a registered model type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey(TypeId);

impl ModelKey {
    /// Returns the key for the model type `M`.
    pub fn of<M: 'static>() -> Self {
        Self(TypeId::of::<M>())
    }
}

impl fmt::Debug for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelKey({:?})", self.0)
    }
}

/// The shape of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationType {
    /// Many rows of the source point at one target row (a foreign key).
    ManyToOne,
    /// One source row pairs with one target row.
    OneToOne,
    /// One source row is pointed at by many target rows (reverse foreign key).
    OneToMany,
    /// Rows on both sides are linked through an intermediate table.
    ManyToMany,
}

impl RelationType {
    /// The relation type seen from the other end of the edge.
    pub const fn inverse(self) -> Self {
        match self {
            Self::ManyToOne => Self::OneToMany,
            Self::OneToMany => Self::ManyToOne,
            Self::OneToOne => Self::OneToOne,
            Self::ManyToMany => Self::ManyToMany,
        }
    }

    /// Returns `true` if the relation can yield several target rows.
    pub const fn is_to_many(self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }
}

/// The target of a relation.
///
/// `Deferred` relations name their target by content-type key (the model
/// name) and are resolved by the registry once a model with that name has
/// been registered. The registry never guesses a target it cannot find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationTarget {
    /// The target model type is known.
    Resolved(ModelKey),
    /// The target is named by content-type key.
    Deferred(String),
}

/// An intermediate model mediating a relation.
///
/// `source_field` is the through model's foreign key to the relation's
/// origin, `target_field` the one to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Through {
    model: ModelKey,
    source_field: String,
    target_field: String,
}

impl Through {
    /// Creates through-model metadata.
    pub fn new(model: ModelKey, source_field: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            model,
            source_field: source_field.into(),
            target_field: target_field.into(),
        }
    }

    /// The intermediate model.
    pub const fn model(&self) -> ModelKey {
        self.model
    }

    /// The through field pointing at the relation's origin.
    pub fn source_field(&self) -> &str {
        &self.source_field
    }

    /// The through field pointing at the relation's target.
    pub fn target_field(&self) -> &str {
        &self.target_field
    }

    /// The same through model seen from the other end.
    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            model: self.model,
            source_field: self.target_field.clone(),
            target_field: self.source_field.clone(),
        }
    }
}

/// A directed edge between two models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    kind: RelationType,
    from: ModelKey,
    name: String,
    target: RelationTarget,
    field: Option<String>,
    through: Option<Through>,
    related_name: Option<String>,
    reverse: bool,
}

impl Relation {
    /// Creates a forward relation declared on field `name` of `from`.
    pub fn forward(kind: RelationType, from: ModelKey, name: impl Into<String>, target: RelationTarget) -> Self {
        Self {
            kind,
            from,
            name: name.into(),
            target,
            field: None,
            through: None,
            related_name: None,
            reverse: false,
        }
    }

    /// Routes the relation through an intermediate model.
    #[must_use]
    pub fn with_through(mut self, through: Through) -> Self {
        self.through = Some(through);
        self
    }

    /// Overrides the alias the reverse relation is registered under.
    #[must_use]
    pub fn with_related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    /// Builds the reverse of this forward relation, registered on the
    /// target model under `alias`.
    ///
    /// The reverse relation's [`field`](Self::field) names the forward
    /// relation's owning field and its through model has source and target
    /// swapped.
    pub(crate) fn reversed(&self, target: ModelKey, alias: impl Into<String>) -> Self {
        Self {
            kind: self.kind.inverse(),
            from: target,
            name: alias.into(),
            target: RelationTarget::Resolved(self.from),
            field: Some(self.name.clone()),
            through: self.through.as_ref().map(Through::swapped),
            related_name: None,
            reverse: true,
        }
    }

    /// The shape of the relation.
    pub const fn relation_type(&self) -> RelationType {
        self.kind
    }

    /// The model the relation starts from.
    pub const fn from(&self) -> ModelKey {
        self.from
    }

    /// The field name (forward) or alias (reverse) on the origin model.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The target as declared.
    pub const fn target(&self) -> &RelationTarget {
        &self.target
    }

    /// The target model, if it is known without a registry lookup.
    pub const fn model(&self) -> Option<ModelKey> {
        match &self.target {
            RelationTarget::Resolved(key) => Some(*key),
            RelationTarget::Deferred(_) => None,
        }
    }

    /// The field on the target the relation resolves to.
    ///
    /// `None` means the target's primary key. For reverse relations this is
    /// always the owning field of the forward relation.
    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    /// The intermediate model, if the relation is through-mediated.
    pub const fn through(&self) -> Option<&Through> {
        self.through.as_ref()
    }

    /// The explicit reverse alias, if one was declared.
    pub fn related_name(&self) -> Option<&str> {
        self.related_name.as_deref()
    }

    /// Returns `true` for relations derived by the registry.
    pub const fn is_reverse(&self) -> bool {
        self.reverse
    }
}
