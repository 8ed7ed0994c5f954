//! Blob reference extraction from records

use crate::types::{BlobReference, Record};

/// Yields the blob reference carried by a record, if any
///
/// Records without one are skipped by the dispatcher; that is expected and not
/// an error. Any `Fn(&Record) -> Option<BlobReference>` closure implements this
/// trait.
pub trait BlobReferenceExtractor: Send + Sync {
    /// Extract the reference, or `None` to skip the record
    fn extract(&self, record: &Record) -> Option<BlobReference>;
}

impl<F> BlobReferenceExtractor for F
where
    F: Fn(&Record) -> Option<BlobReference> + Send + Sync,
{
    fn extract(&self, record: &Record) -> Option<BlobReference> {
        self(record)
    }
}

/// Reads an attachment token object from a named record field
///
/// The field must hold a JSON object. Missing fields, `null`, and scalar
/// values mean "no attachment".
#[derive(Clone, Debug)]
pub struct FieldExtractor {
    field: String,
}

impl FieldExtractor {
    /// Extract from `field`
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    /// The field this extractor reads
    pub fn field(&self) -> &str {
        &self.field
    }
}

impl BlobReferenceExtractor for FieldExtractor {
    fn extract(&self, record: &Record) -> Option<BlobReference> {
        record
            .get(&self.field)
            .filter(|value| value.is_object())
            .map(|value| BlobReference::new(value.clone()))
    }
}

/// Records paired with their references, plus how many were skipped
pub(crate) struct Eligible {
    pub(crate) items: Vec<(Record, BlobReference)>,
    pub(crate) skipped: usize,
}

/// Split a snapshot into records with a reference and a skipped count
pub(crate) fn select_eligible(
    extractor: &dyn BlobReferenceExtractor,
    records: Vec<Record>,
) -> Eligible {
    let mut items = Vec::with_capacity(records.len());
    let mut skipped = 0;

    for record in records {
        match extractor.extract(&record) {
            Some(reference) => items.push((record, reference)),
            None => {
                tracing::trace!(record_id = %record.id, "Record has no blob reference, skipping");
                skipped += 1;
            }
        }
    }

    Eligible { items, skipped }
}
