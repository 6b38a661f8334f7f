//! Field-path resolution.
//!
//! [`walk`] turns a dotted path such as `"User.Profile.Image"` into a
//! [`RelationChain`]: one [`PathNode`] per segment, each naming the model the
//! segment was resolved on, the field it resolved to and, for relation
//! segments, the model the walk advanced to.
//!
//! A segment resolves, in order, to `pk` (the primary key, unless a field is
//! actually named `pk`), a declared field, or a reverse relation registered
//! on the current model. Intermediate segments must be relations; the final
//! segment may be anything unless the caller asks for the terminal relation.

use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};

use crate::fields::FieldDef;
use crate::registry::{ModelMeta, Registry};
use crate::relation::{Relation, Through};

/// One resolved path segment.
#[derive(Debug, Clone)]
pub struct PathNode {
    /// The model the segment was resolved on.
    pub model: Arc<ModelMeta>,
    /// The field the segment names. Reverse relations resolve to a virtual
    /// field without column.
    pub field: FieldDef,
    /// The relation the segment follows, if it is a relation.
    pub relation: Option<Relation>,
    /// The zero-based position of the segment in the path.
    pub depth: usize,
    /// The model reached by following the relation, when the walk did.
    pub target: Option<Arc<ModelMeta>>,
}

impl PathNode {
    /// Returns `true` if the segment names a relation.
    pub const fn is_relation(&self) -> bool {
        self.relation.is_some()
    }
}

/// The result of walking a field path.
#[derive(Debug, Clone)]
pub struct RelationChain {
    nodes: Vec<PathNode>,
}

impl RelationChain {
    /// Every resolved segment in path order.
    pub fn nodes(&self) -> &[PathNode] {
        &self.nodes
    }

    /// The final segment.
    pub fn last(&self) -> Option<&PathNode> {
        self.nodes.last()
    }

    /// The relation of the final segment, if it is one.
    pub fn final_relation(&self) -> Option<&Relation> {
        self.last().and_then(|n| n.relation.as_ref())
    }

    /// The model the final relation points at, when it was traversed.
    pub fn target_model(&self) -> Option<&Arc<ModelMeta>> {
        self.last().and_then(|n| n.target.as_ref())
    }

    /// The field the final relation resolves to on its target: the owning
    /// field for reverse relations, the primary key otherwise.
    pub fn target_field(&self) -> Option<&FieldDef> {
        let target = self.target_model()?;
        match self.final_relation()?.field() {
            Some(name) if self.final_relation()?.is_reverse() => target.field(name),
            _ => target.primary_key(),
        }
    }

    /// The through model of the final relation, if through-mediated.
    pub fn through(&self) -> Option<&Through> {
        self.final_relation().and_then(Relation::through)
    }

    /// The model the field of the final segment lives on.
    pub fn leaf_model(&self) -> Option<&Arc<ModelMeta>> {
        self.last().map(|n| &n.model)
    }
}

fn unknown_field(meta: &ModelMeta, segment: &str) -> QuarryError {
    QuarryError::UnknownField {
        model: meta.model_name().to_string(),
        field: segment.to_string(),
        valid: meta.field_names(),
    }
}

fn lookup_segment(meta: &ModelMeta, segment: &str) -> QuarryResult<FieldDef> {
    if segment == "pk" && meta.field("pk").is_none() {
        return meta.require_pk().cloned();
    }
    if let Some(field) = meta.field(segment).filter(|f| !f.is_reverse_slot()) {
        return Ok(field.clone());
    }
    meta.reverse(segment)
        .map(FieldDef::virtual_relation)
        .ok_or_else(|| unknown_field(meta, segment))
}

/// Walks `path` starting at `root`.
///
/// With `include_terminal` set, a final relation segment is traversed too,
/// so [`RelationChain::target_model`] is available; the walk then fails if
/// the target cannot be resolved.
pub fn walk(registry: &Registry, root: &Arc<ModelMeta>, path: &str, include_terminal: bool) -> QuarryResult<RelationChain> {
    if path.is_empty() {
        return Err(unknown_field(root, path));
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = Arc::clone(root);
    let mut nodes = Vec::with_capacity(segments.len());

    for (depth, segment) in segments.iter().enumerate() {
        let field = lookup_segment(&current, segment)?;
        let relation = field.relation().cloned();
        let is_last = depth + 1 == segments.len();

        let mut node = PathNode {
            model: Arc::clone(&current),
            field,
            relation,
            depth,
            target: None,
        };

        if !is_last || include_terminal {
            match node.relation.as_ref().map(|r| registry.resolve(r)) {
                Some(Some(target)) => {
                    node.target = Some(Arc::clone(&target));
                    current = target;
                }
                None if is_last => {}
                _ => {
                    return Err(QuarryError::UnknownRelation {
                        model: current.model_name().to_string(),
                        name: (*segment).to_string(),
                    });
                }
            }
        }
        nodes.push(node);
    }

    Ok(RelationChain { nodes })
}
