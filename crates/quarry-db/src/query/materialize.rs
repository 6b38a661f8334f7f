//! Turning result rows into model objects.
//!
//! A [`ScanPlan`] describes how the columns of a compiled SELECT map onto
//! a tree of objects: node 0 is the queried model, every other node is a
//! related model reached through the `slot` field of its parent node.
//! Materialization rebuilds that tree for every row, merging rows that
//! repeat an object already seen, and then attaches children to their
//! parents bottom-up.

use std::collections::HashMap;
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};

use crate::context::QueryContext;
use crate::fields::AnyModel;
use crate::model::{same_key, Model};
use crate::registry::{ModelMeta, Registry};
use crate::related::RelationScope;
use crate::value::{Row, Value};

/// One model occurrence in a scan.
#[derive(Debug, Clone)]
pub(crate) struct ScanNode {
    /// The relation path leading to this node; empty for the root.
    pub(crate) path: String,
    pub(crate) meta: Arc<ModelMeta>,
    pub(crate) parent: Option<usize>,
    /// The field on the parent that stores objects of this node.
    pub(crate) slot: Option<String>,
    /// The table alias the node's columns are read from.
    pub(crate) alias: String,
}

/// One selected column: a field of a scan node.
#[derive(Debug, Clone)]
pub(crate) struct ScanColumn {
    pub(crate) node: usize,
    /// Index into the node model's fields.
    pub(crate) field: usize,
    /// The column label in values mode.
    pub(crate) label: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ScanPlan {
    pub(crate) nodes: Vec<ScanNode>,
    pub(crate) columns: Vec<ScanColumn>,
    /// Annotation names, selected after the columns.
    pub(crate) annotations: Vec<String>,
    /// Whether rows may repeat a root object.
    pub(crate) dedupe: bool,
}

impl ScanPlan {
    pub(crate) fn new(root: Arc<ModelMeta>) -> Self {
        let alias = root.table().to_string();
        Self {
            nodes: vec![ScanNode {
                path: String::new(),
                meta: root,
                parent: None,
                slot: None,
                alias,
            }],
            columns: Vec::new(),
            annotations: Vec::new(),
            dedupe: false,
        }
    }

    /// Position of the primary-key column of `node` in a row.
    fn pk_position(&self, node: usize) -> Option<usize> {
        let meta = &self.nodes[node].meta;
        self.columns
            .iter()
            .position(|c| c.node == node && meta.fields()[c.field].is_primary_key())
    }
}

/// A model object together with the annotations selected alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotated<M> {
    /// The materialized object.
    pub object: M,
    /// Annotation values, keyed by annotation name.
    pub annotations: Row,
}

struct Entry {
    node: usize,
    object: Option<AnyModel>,
    pk: Value,
    children: Vec<usize>,
}

struct Builder<'a> {
    plan: &'a ScanPlan,
    pk_positions: Vec<Option<usize>>,
    arena: Vec<Entry>,
    roots: Vec<(usize, Vec<Value>)>,
    seen: HashMap<String, usize>,
}

impl<'a> Builder<'a> {
    fn new(plan: &'a ScanPlan) -> Self {
        Self {
            plan,
            pk_positions: (0..plan.nodes.len()).map(|n| plan.pk_position(n)).collect(),
            arena: Vec::new(),
            roots: Vec::new(),
            seen: HashMap::new(),
        }
    }

    fn create(&mut self, node: usize, pk: Value, row: &Row) -> QuarryResult<usize> {
        let meta = &self.plan.nodes[node].meta;
        let mut object = meta.instantiate();
        for (i, col) in self.plan.columns.iter().enumerate() {
            if col.node == node {
                meta.fields()[col.field].set_value(&mut *object, &row.values()[i])?;
            }
        }
        self.arena.push(Entry {
            node,
            object: Some(object),
            pk,
            children: Vec::new(),
        });
        Ok(self.arena.len() - 1)
    }

    fn pk_of(&self, node: usize, row: &Row) -> Value {
        self.pk_positions[node].map_or(Value::Null, |i| row.values()[i].clone())
    }

    fn push_row(&mut self, row: &Row) -> QuarryResult<()> {
        let plan = self.plan;
        let root_pk = self.pk_of(0, row);
        let root = match self.seen.get(&root_pk.identity()) {
            Some(&idx) if plan.dedupe => idx,
            _ => {
                let idx = self.create(0, root_pk.clone(), row)?;
                let first = plan.columns.len();
                let annotations = row.values()[first..].to_vec();
                self.roots.push((idx, annotations));
                if plan.dedupe && !root_pk.is_null() {
                    self.seen.insert(root_pk.identity(), idx);
                }
                idx
            }
        };

        let mut entries: Vec<Option<usize>> = vec![None; plan.nodes.len()];
        entries[0] = Some(root);
        for node in 1..plan.nodes.len() {
            let Some(parent) = plan.nodes[node].parent.and_then(|p| entries[p]) else {
                continue;
            };
            let pk = self.pk_of(node, row);
            if pk.is_null() {
                continue;
            }
            let existing = self.arena[parent]
                .children
                .iter()
                .copied()
                .find(|&c| self.arena[c].node == node && same_key(&self.arena[c].pk, &pk));
            let idx = match existing {
                Some(idx) => idx,
                None => {
                    let idx = self.create(node, pk, row)?;
                    self.arena[parent].children.push(idx);
                    idx
                }
            };
            entries[node] = Some(idx);
        }
        Ok(())
    }

    /// Takes the object of `idx` out of the arena with all its children
    /// attached.
    fn assemble(&mut self, idx: usize, registry: &Registry, context: &QueryContext) -> QuarryResult<AnyModel> {
        let plan = self.plan;
        let children = std::mem::take(&mut self.arena[idx].children);
        let node = &plan.nodes[self.arena[idx].node];
        let pk = self.arena[idx].pk.clone();
        let mut object = self.arena[idx]
            .object
            .take()
            .ok_or_else(|| QuarryError::DatabaseError(format!("object {} materialized twice", node.path)))?;
        bind_relations(&node.meta, &mut *object, &pk, registry, context);

        for child in children {
            let child_node = &plan.nodes[self.arena[child].node];
            let child_pk = self.arena[child].pk.clone();
            let related = self.assemble(child, registry, context)?;
            let slot = child_node
                .slot
                .as_deref()
                .and_then(|name| node.meta.field(name))
                .filter(|f| f.has_slot());
            if let Some(slot) = slot {
                slot.attach(&mut *object, related, &child_pk)?;
            }
        }
        Ok(object)
    }
}

/// Binds every relation container of `obj` to its parent key. Containers
/// inherit `context`.
pub(crate) fn bind_relations(
    meta: &ModelMeta,
    obj: &mut dyn std::any::Any,
    pk: &Value,
    registry: &Registry,
    context: &QueryContext,
) {
    if pk.is_unset_key() {
        return;
    }
    for field in meta.fields() {
        let relation = if field.is_reverse_slot() {
            meta.reverse(field.name())
        } else {
            field.relation().cloned()
        };
        if let Some(relation) = relation {
            field.bind(
                obj,
                RelationScope {
                    registry: registry.clone(),
                    parent_pk: pk.clone(),
                    relation,
                    context: context.clone(),
                },
            );
        }
    }
}

/// Binds the relation containers of a typed model.
pub(crate) fn bind_object<M: Model>(obj: &mut M, meta: &ModelMeta, registry: &Registry, context: &QueryContext) {
    let pk = meta.pk_of(&*obj);
    bind_relations(meta, obj, &pk, registry, context);
}

/// Writes the values of `row`, one per concrete field in declaration order,
/// into `obj`.
pub(crate) fn scan_into<M: Model>(meta: &ModelMeta, obj: &mut M, row: &Row) -> QuarryResult<()> {
    for (field, value) in meta.concrete_fields().zip(row.values()) {
        field.set_value(obj, value)?;
    }
    Ok(())
}

/// Materializes `rows` into objects of `M`.
pub(crate) fn materialize<M: Model>(
    plan: &ScanPlan,
    rows: &[Row],
    registry: &Registry,
    context: &QueryContext,
) -> QuarryResult<Vec<Annotated<M>>> {
    let mut builder = Builder::new(plan);
    for row in rows {
        if row.len() != plan.columns.len() + plan.annotations.len() {
            return Err(QuarryError::DatabaseError(format!(
                "expected {} columns, got {}",
                plan.columns.len() + plan.annotations.len(),
                row.len()
            )));
        }
        builder.push_row(row)?;
    }

    let roots = std::mem::take(&mut builder.roots);
    let mut out = Vec::with_capacity(roots.len());
    for (idx, annotations) in roots {
        let object = builder.assemble(idx, registry, context)?;
        let object = object
            .downcast::<M>()
            .map_err(|_| QuarryError::type_mismatch(std::any::type_name::<M>(), "another model type"))?;
        out.push(Annotated {
            object: *object,
            annotations: Row::new(plan.annotations.clone(), annotations),
        });
    }
    Ok(out)
}
