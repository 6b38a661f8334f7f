//! Bulk database operations.
//!
//! `bulk_create` inserts many objects with as few statements as the
//! backend's returning capability allows; `bulk_update` writes a chosen set
//! of fields of many objects, one UPDATE per object.

use quarry_core::{QuarryError, QuarryResult};

use super::compiler::{compile_insert, compile_update_object};
use super::materialize::{bind_object, scan_into};
use super::queryset::QuerySet;
use crate::executor::{DbExecutor, Returning};
use crate::fields::FieldDef;
use crate::model::Model;
use crate::value::Value;

/// Options for `bulk_create` operations.
#[derive(Debug, Clone, Default)]
pub struct BulkCreateOptions {
    /// Number of objects to create per statement. None means all at once.
    pub batch_size: Option<usize>,
}

fn row_values<M: Model>(fields: &[&FieldDef], obj: &M) -> Vec<Value> {
    fields
        .iter()
        .map(|f| f.value_of(obj).unwrap_or(Value::Null))
        .collect()
}

impl<M: Model> QuerySet<M> {
    /// Inserts every object in `objects`. Returns the number of rows
    /// inserted.
    pub async fn bulk_create(&self, objects: &mut [M], db: &dyn DbExecutor) -> QuarryResult<u64> {
        self.bulk_create_with(objects, &BulkCreateOptions::default(), db).await
    }

    /// Inserts every object in `objects` in batches.
    ///
    /// Either every object carries its primary key or none does. Generated
    /// keys are written back when the backend reports them: all columns with
    /// `Returning::Columns`, the key alone with `Returning::LastInsertId`
    /// (one INSERT per object), nothing with `Returning::Nothing`.
    pub async fn bulk_create_with(
        &self,
        objects: &mut [M],
        options: &BulkCreateOptions,
        db: &dyn DbExecutor,
    ) -> QuarryResult<u64> {
        let meta = self.meta()?;
        let Some(first) = objects.first() else {
            return Ok(0);
        };
        let fields = Self::insert_fields(&meta, first);
        let keyed = !meta.pk_of(first).is_unset_key();
        if objects.iter().any(|o| meta.pk_of(o).is_unset_key() == keyed) {
            return Err(QuarryError::ConfigurationError(format!(
                "bulk_create of {} mixes objects with and without primary key",
                meta.model_name()
            )));
        }
        if !self.state.explicit_save {
            for obj in objects.iter_mut() {
                obj.before_save()?;
            }
        }

        let backend = db.backend_type();
        let returning = db.returning();
        let batch_size = match returning {
            Returning::LastInsertId => 1,
            _ => options.batch_size.unwrap_or(objects.len()).max(1),
        };

        let mut total = 0u64;
        for chunk in objects.chunks_mut(batch_size) {
            let rows = chunk.iter().map(|o| row_values(&fields, o)).collect();
            let query = self.record(
                compile_insert(&meta, &fields, rows, returning == Returning::Columns),
                backend,
            );
            match returning {
                Returning::Columns => {
                    let rows = self.run("bulk_create", db.query(&query.sql, &query.params)).await?;
                    if rows.len() != chunk.len() {
                        return Err(QuarryError::DatabaseError(format!(
                            "INSERT returned {} rows for {} objects",
                            rows.len(),
                            chunk.len()
                        )));
                    }
                    for (obj, row) in chunk.iter_mut().zip(&rows) {
                        scan_into(&meta, obj, row)?;
                    }
                    total += chunk.len() as u64;
                }
                Returning::LastInsertId => {
                    let id = self
                        .run("bulk_create", db.insert_returning_id(&query.sql, &query.params))
                        .await?;
                    if let Some(pk) = meta.primary_key() {
                        for obj in chunk.iter_mut() {
                            if meta.pk_of(&*obj).is_unset_key() {
                                pk.set_value(obj, &id)?;
                            }
                        }
                    }
                    total += chunk.len() as u64;
                }
                Returning::Nothing => {
                    total += self
                        .run("bulk_create", db.execute_sql(&query.sql, &query.params))
                        .await?;
                }
            }
        }

        for obj in objects.iter_mut() {
            bind_object(obj, &meta, &self.registry, &self.context);
            if !self.state.explicit_save {
                obj.after_save()?;
            }
        }
        Ok(total)
    }

    /// Writes `fields` of every object in `objects`. Returns the number of
    /// rows updated.
    ///
    /// Every object must carry its primary key.
    pub async fn bulk_update(&self, objects: &mut [M], fields: &[&str], db: &dyn DbExecutor) -> QuarryResult<u64> {
        let meta = self.meta()?;
        if objects.is_empty() || fields.is_empty() {
            return Ok(0);
        }
        let defs = fields
            .iter()
            .map(|name| {
                meta.field(name)
                    .filter(|f| f.is_concrete() && f.is_editable() && !f.is_primary_key())
                    .ok_or_else(|| QuarryError::UnknownField {
                        model: meta.model_name().to_string(),
                        field: (*name).to_string(),
                        valid: meta
                            .concrete_fields()
                            .filter(|f| f.is_editable() && !f.is_primary_key())
                            .map(|f| f.name().to_string())
                            .collect(),
                    })
            })
            .collect::<QuarryResult<Vec<_>>>()?;

        let backend = db.backend_type();
        let returning = db.returning() == Returning::Columns;
        let mut total = 0u64;
        meta.require_pk()?;
        for obj in objects.iter_mut() {
            let pk = meta.pk_of(&*obj);
            if pk.is_unset_key() {
                return Err(QuarryError::ConfigurationError(
                    "bulk_update requires all objects to have a primary key set".to_string(),
                ));
            }
            let values = row_values(&defs, &*obj);
            let query = self.record(compile_update_object(&meta, &defs, values, pk, returning)?, backend);
            if returning {
                let rows = self.run("bulk_update", db.query(&query.sql, &query.params)).await?;
                if let Some(row) = rows.first() {
                    scan_into(&meta, obj, row)?;
                    total += 1;
                }
            } else {
                total += self
                    .run("bulk_update", db.execute_sql(&query.sql, &query.params))
                    .await?;
            }
        }
        Ok(total)
    }
}
