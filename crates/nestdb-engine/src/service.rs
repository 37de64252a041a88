//! Service facade: the uniform verbs every frontend adapter consumes.
//!
//! Frontends (HTTP, wire protocols) never touch the registry directly;
//! they speak these operations and translate `NestError::kind()` tokens
//! into protocol responses.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use nestdb_common::{NestError, Result};
use serde_json::{Map, Value};

use crate::collection::Collection;
use crate::database::{Database, Status};

pub struct Service {
    db: Arc<Database>,
}

impl Service {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Reject work while the database is opening or closing.
    fn ensure_operating(&self) -> Result<()> {
        match self.db.status() {
            Status::Operating => Ok(()),
            other => Err(NestError::Unavailable(format!(
                "database is {}",
                other.as_str()
            ))),
        }
    }

    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.ensure_operating()?;
        self.db.create_collection(name)
    }

    pub fn get_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.ensure_operating()?;
        self.db.get_collection(name)
    }

    /// Fetch a collection, creating it on first use.
    pub fn ensure_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.ensure_operating()?;
        match self.db.get_collection(name) {
            Ok(collection) => Ok(collection),
            Err(_) => match self.db.create_collection(name) {
                Ok(collection) => Ok(collection),
                // A racing creator is fine: take theirs.
                Err(NestError::CollectionExists(_)) => self.db.get_collection(name),
                Err(err) => Err(err),
            },
        }
    }

    pub fn list_collections(&self) -> Result<HashMap<String, Arc<Collection>>> {
        self.ensure_operating()?;
        Ok(self.db.list_collections())
    }

    pub fn delete_collection(&self, name: &str) -> Result<()> {
        self.ensure_operating()?;
        self.db.drop_collection(name)
    }

    /// Insert every JSON document read from a stream (concatenated or
    /// whitespace-separated objects). Returns how many landed.
    pub fn insert_stream(&self, name: &str, reader: impl Read) -> Result<usize> {
        let collection = self.get_collection(name)?;

        let mut inserted = 0usize;
        let stream = serde_json::Deserializer::from_reader(reader).into_iter::<Map<String, Value>>();
        for document in stream {
            let document = document.map_err(|e| NestError::MalformedJson(e.to_string()))?;
            collection.insert(&document)?;
            inserted += 1;
        }
        Ok(inserted)
    }
}
