use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use super::object_types;
use super::traits::{ChunkWriteResponse, SorBackend, SorError, SorItemError, SorRecord, SorUpdate};
use crate::types::fields;

/// In-process system of record.
///
/// Subject records get a derived `active_count`: the number of items whose
/// `subject` is that record's id and whose `status` is `active`. Calls above
/// `max_batch_size` are refused with HTTP 400, as a real provider would.
pub struct InMemorySor {
    rows: DashMap<(String, String), Map<String, Value>>,
    max_batch_size: usize,
    read_calls: AtomicU64,
    write_calls: AtomicU64,
}

impl InMemorySor {
    #[must_use]
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            rows: DashMap::new(),
            max_batch_size,
            read_calls: AtomicU64::new(0),
            write_calls: AtomicU64::new(0),
        }
    }

    /// Insert or replace a row.
    pub fn insert(&self, object_type: &str, id: &str, properties: Value) {
        let props = match properties {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.rows.insert((object_type.to_string(), id.to_string()), props);
    }

    #[must_use]
    pub fn row(&self, object_type: &str, id: &str) -> Option<Map<String, Value>> {
        self.rows
            .get(&(object_type.to_string(), id.to_string()))
            .map(|r| r.value().clone())
    }

    #[must_use]
    pub fn active_count(&self, subject: &str) -> u64 {
        self.rows
            .iter()
            .filter(|r| {
                let (object_type, _) = r.key();
                let props = r.value();
                object_type == object_types::ITEMS
                    && props.get(fields::SUBJECT).and_then(Value::as_str) == Some(subject)
                    && props.get(fields::STATUS).and_then(Value::as_str) == Some("active")
            })
            .count() as u64
    }

    #[must_use]
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    fn check_size(&self, len: usize) -> Result<(), SorError> {
        if len > self.max_batch_size {
            return Err(SorError::Status {
                status: 400,
                body: format!("batch of {} exceeds limit {}", len, self.max_batch_size),
            });
        }
        Ok(())
    }

    fn project(&self, object_type: &str, id: &str, props: &Map<String, Value>, wanted: &[String]) -> SorRecord {
        let mut out = Map::new();
        for field in wanted {
            if field == fields::ACTIVE_COUNT && object_type == object_types::SUBJECTS {
                out.insert(field.clone(), Value::from(self.active_count(id)));
            } else if let Some(v) = props.get(field) {
                out.insert(field.clone(), v.clone());
            }
        }
        SorRecord { id: id.to_string(), properties: out }
    }
}

#[async_trait]
impl SorBackend for InMemorySor {
    async fn batch_read(
        &self,
        object_type: &str,
        ids: &[String],
        fields: &[String],
    ) -> Result<Vec<SorRecord>, SorError> {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        self.check_size(ids.len())?;

        Ok(ids
            .iter()
            .filter_map(|id| {
                self.row(object_type, id)
                    .map(|props| self.project(object_type, id, &props, fields))
            })
            .collect())
    }

    async fn batch_write(
        &self,
        object_type: &str,
        updates: &[SorUpdate],
    ) -> Result<ChunkWriteResponse, SorError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        self.check_size(updates.len())?;

        let mut response = ChunkWriteResponse::default();
        for update in updates {
            let key = (object_type.to_string(), update.id.clone());
            match self.rows.get_mut(&key) {
                Some(mut row) => {
                    for (k, v) in &update.properties {
                        row.insert(k.clone(), v.clone());
                    }
                    response.results.push(SorRecord {
                        id: update.id.clone(),
                        properties: row.clone(),
                    });
                }
                None => response.errors.push(SorItemError {
                    id: update.id.clone(),
                    code: "NOT_FOUND".into(),
                    message: format!("{} '{}' does not exist", object_type, update.id),
                }),
            }
        }
        Ok(response)
    }
}
