use serde_json::{json, Value};

use aggscope::Config;

/// Configured entity types with the indices a search for them runs against.
pub fn list_entities(config: &Config) -> Value {
    let mut names: Vec<&String> = config.entities.keys().collect();
    names.sort();

    let entities: Vec<Value> = names
        .into_iter()
        .map(|name| {
            let meta = &config.entities[name];
            let search = if meta.search_index_names.is_empty() {
                vec![meta.index_name.clone()]
            } else {
                meta.search_index_names.clone()
            };
            json!({
                "entity": name,
                "index_name": meta.index_name,
                "index_type": meta.index_type(),
                "search_indices": search,
                "shards": meta.number_of_shards,
                "replicas": meta.number_of_replicas,
                "print_log": meta.print_log,
            })
        })
        .collect();
    Value::Array(entities)
}
