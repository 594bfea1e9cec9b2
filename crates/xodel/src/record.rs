//! Result rows bound to their model.

use std::sync::Arc;

use serde_json::{Map, Value};
use xodel_core::Model;

/// A validated, loaded row together with the model it belongs to. Records
/// come out of query results and save calls; the model reference is what
/// lets a record be saved back without re-stating its schema.
#[derive(Debug, Clone)]
pub struct Record {
    model: Arc<Model>,
    data: Map<String, Value>,
}

impl Record {
    /// Wrap already-loaded row data.
    #[must_use]
    pub fn new(model: Arc<Model>, data: Map<String, Value>) -> Self {
        Self { model, data }
    }

    /// Run raw result data through the model's field load transforms first.
    #[must_use]
    pub fn load(model: Arc<Model>, data: Map<String, Value>) -> Self {
        let data = model.load_row(data);
        Self { model, data }
    }

    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// The primary key value, if the model has one and it is set.
    #[must_use]
    pub fn key(&self) -> Option<&Value> {
        self.data.get(self.model.primary_key.as_deref()?)
    }

    #[must_use]
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xodel_core::{Field, ModelSpec};

    fn model() -> Arc<Model> {
        ModelSpec::new("usr")
            .field(Field::string("name").required())
            .field(Field::json("profile"))
            .materialize()
            .unwrap()
    }

    #[test]
    fn test_key_reads_primary_key() {
        let mut data = Map::new();
        data.insert("id".to_string(), json!(3));
        data.insert("name".to_string(), json!("tom"));
        let record = Record::new(model(), data);
        assert_eq!(record.key(), Some(&json!(3)));
        assert_eq!(record.get("name"), Some(&json!("tom")));
    }

    #[test]
    fn test_load_applies_field_transforms() {
        let mut data = Map::new();
        data.insert("profile".to_string(), json!("{\"a\":1}"));
        let record = Record::load(model(), data);
        assert_eq!(record.get("profile"), Some(&json!({"a": 1})));
    }
}
