//! The owner's chat style: a JSON document describing tone and phrasing,
//! rendered into the instruction block every reply is generated from.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_MAX_REPLY_LENGTH: usize = 500;

/// One prompt/response pair showing how the owner answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleExchange {
    pub prompt: String,
    pub response: String,
}

pub struct StyleProfile {
    path: PathBuf,
    document: Mutex<Value>,
}

impl StyleProfile {
    /// Load the style document, writing a default one if the file is missing.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let document = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read chat style {:?}", path))?;
            let document: Value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse chat style {:?}", path))?;
            if !document.is_object() {
                bail!("Chat style {:?} must be a JSON object", path);
            }
            document
        } else {
            tracing::warn!("Chat style {:?} not found, writing default style", path);
            let document = default_style_document();
            write_document(&path, &document)?;
            document
        };

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    fn lock_document(&self) -> Result<MutexGuard<'_, Value>> {
        self.document
            .lock()
            .map_err(|e| anyhow!("Style lock poisoned: {}", e))
    }

    /// Snapshot of the full document (for the dashboard).
    pub fn document(&self) -> Result<Value> {
        Ok(self.lock_document()?.clone())
    }

    /// Render the model instruction block. Same document, same bytes.
    pub fn render_instructions(&self) -> Result<String> {
        let document = self.lock_document()?;
        Ok(render_instructions(&document))
    }

    /// All stored example exchanges, in the order they were added.
    pub fn example_exchanges(&self) -> Result<Vec<ExampleExchange>> {
        let document = self.lock_document()?;
        Ok(example_exchanges(&document))
    }

    pub fn max_reply_length(&self) -> Result<usize> {
        let document = self.lock_document()?;
        Ok(max_reply_length(&document))
    }

    /// Deep-merge `patch` into the document and persist it.
    pub fn apply_update(&self, patch: &Value) -> Result<()> {
        if !patch.is_object() {
            bail!("Style update must be a JSON object");
        }
        let mut document = self.lock_document()?;
        let mut updated = document.clone();
        deep_merge(&mut updated, patch);
        write_document(&self.path, &updated)?;
        *document = updated;
        Ok(())
    }

    /// Append an example exchange and persist.
    pub fn add_example(&self, prompt: &str, response: &str) -> Result<()> {
        let mut document = self.lock_document()?;
        let mut updated = document.clone();
        let Some(root) = updated.as_object_mut() else {
            bail!("Chat style document is not a JSON object");
        };

        let examples = root
            .entry("example_conversations")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !examples.is_array() {
            *examples = Value::Array(Vec::new());
        }
        if let Value::Array(list) = examples {
            list.push(json!({
                "context": prompt,
                "my_response": response,
                "added_at": Utc::now().to_rfc3339(),
            }));
        }

        write_document(&self.path, &updated)?;
        *document = updated;
        Ok(())
    }
}

/// Recursive merge: only mapping-into-mapping recurses; any other update
/// value replaces what was there.
pub fn deep_merge(base: &mut Value, updates: &Value) {
    match (base, updates) {
        (Value::Object(base_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                let nested = value.is_object() && base_map.get(key).is_some_and(Value::is_object);
                match base_map.get_mut(key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, updates) => *base = updates.clone(),
    }
}

fn render_instructions(document: &Value) -> String {
    let empty = Map::new();
    let personality = section(document, "personality").unwrap_or(&empty);
    let rules = section(document, "response_rules").unwrap_or(&empty);
    let phrases_use = string_list(document, "phrases_i_use");
    let phrases_avoid = string_list(document, "phrases_i_avoid");

    let mut prompt = String::from(
        "You are an AI assistant that mimics a specific person's communication style.\n\n",
    );

    prompt.push_str("PERSONALITY:\n");
    prompt.push_str(&format!("- Tone: {}\n", field(personality, "tone", "friendly")));
    prompt.push_str(&format!(
        "- Formality: {}\n",
        field(personality, "formality", "informal")
    ));
    prompt.push_str(&format!(
        "- Humor level: {}\n",
        field(personality, "humor", "moderate")
    ));
    prompt.push_str(&format!(
        "- Emoji usage: {}\n",
        field(personality, "emoji_usage", "occasional")
    ));
    prompt.push_str(&format!(
        "- Response length: {}\n",
        field(personality, "response_length", "concise")
    ));

    prompt.push_str("\nLANGUAGE PATTERNS:\n");
    if !phrases_use.is_empty() {
        prompt.push_str(&format!(
            "- Commonly use phrases: {}\n",
            phrases_use.join(", ")
        ));
    }
    if !phrases_avoid.is_empty() {
        prompt.push_str(&format!("- Avoid phrases: {}\n", phrases_avoid.join(", ")));
    }

    prompt.push_str("\nRESPONSE RULES:\n");
    prompt.push_str(&format!(
        "- Maximum length: {} characters\n",
        max_reply_length(document)
    ));
    prompt.push_str(&format!(
        "- Use contractions: {}\n",
        field(rules, "use_contractions", "true")
    ));
    prompt.push_str(&format!(
        "- Capitalization: {}\n",
        field(rules, "capitalization", "normal")
    ));
    prompt.push_str(&format!(
        "- Punctuation: {}\n",
        field(rules, "punctuation_style", "minimal")
    ));

    prompt.push_str(
        "\nRespond naturally as this person would, maintaining their unique communication style.",
    );
    prompt
}

fn example_exchanges(document: &Value) -> Vec<ExampleExchange> {
    document
        .get("example_conversations")
        .and_then(Value::as_array)
        .map(|examples| {
            examples
                .iter()
                .filter_map(|example| {
                    let prompt = example.get("context").and_then(Value::as_str)?;
                    let response = example.get("my_response").and_then(Value::as_str)?;
                    Some(ExampleExchange {
                        prompt: prompt.to_string(),
                        response: response.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn max_reply_length(document: &Value) -> usize {
    document
        .get("response_rules")
        .and_then(|rules| rules.get("max_length"))
        .and_then(Value::as_u64)
        .map(|len| len as usize)
        .unwrap_or(DEFAULT_MAX_REPLY_LENGTH)
}

fn section<'a>(document: &'a Value, key: &str) -> Option<&'a Map<String, Value>> {
    document.get(key).and_then(Value::as_object)
}

fn field(map: &Map<String, Value>, key: &str, default: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => default.to_string(),
        Some(other) => other.to_string(),
    }
}

fn string_list(document: &Value, key: &str) -> Vec<String> {
    document
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn write_document(path: &Path, document: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
    }
    let serialized =
        serde_json::to_string_pretty(document).context("Failed to serialize chat style")?;
    let mut tmp = path.to_path_buf();
    tmp.set_extension("json.tmp");
    fs::write(&tmp, serialized).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

fn default_style_document() -> Value {
    json!({
        "name": "My Style",
        "personality": {
            "tone": "friendly",
            "formality": "informal",
            "humor": "moderate",
            "emoji_usage": "occasional",
            "response_length": "concise"
        },
        "phrases_i_use": [],
        "phrases_i_avoid": [],
        "response_rules": {
            "max_length": DEFAULT_MAX_REPLY_LENGTH,
            "use_contractions": true,
            "capitalization": "normal",
            "punctuation_style": "minimal"
        },
        "example_conversations": []
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn profile_with(document: Value) -> (TempDir, StyleProfile) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("my_style.json");
        fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();
        let profile = StyleProfile::load(&path).expect("load style");
        (dir, profile)
    }

    #[test]
    fn deep_merge_replaces_nested_leaf_and_keeps_siblings() {
        let mut base = json!({"personality": {"tone": "formal"}, "name": "Original"});
        deep_merge(&mut base, &json!({"personality": {"tone": "casual"}}));
        assert_eq!(
            base,
            json!({"personality": {"tone": "casual"}, "name": "Original"})
        );
    }

    #[test]
    fn deep_merge_empty_update_is_identity() {
        let original = json!({"personality": {"tone": "formal", "humor": "dry"}, "list": [1, 2]});
        let mut base = original.clone();
        deep_merge(&mut base, &json!({}));
        assert_eq!(base, original);
    }

    #[test]
    fn deep_merge_non_mapping_values_replace_outright() {
        let mut base = json!({
            "phrases_i_use": ["a", "b", "c"],
            "personality": {"tone": "formal"},
            "count": 1
        });
        deep_merge(
            &mut base,
            &json!({"phrases_i_use": ["z"], "personality": "gone", "count": {"nested": true}}),
        );
        assert_eq!(base["phrases_i_use"], json!(["z"]));
        assert_eq!(base["personality"], json!("gone"));
        assert_eq!(base["count"], json!({"nested": true}));
    }

    #[test]
    fn render_includes_personality_and_phrases() {
        let (_dir, profile) = profile_with(json!({
            "personality": {
                "tone": "casual",
                "formality": "informal",
                "humor": "high",
                "emoji_usage": "frequent"
            },
            "phrases_i_use": ["honestly", "you know"],
            "phrases_i_avoid": ["literally"],
            "response_rules": {"max_length": 500, "use_contractions": true}
        }));

        let prompt = profile.render_instructions().expect("render");
        assert!(prompt.contains("- Tone: casual"));
        assert!(prompt.contains("- Formality: informal"));
        assert!(prompt.contains("honestly, you know"));
        assert!(prompt.contains("- Avoid phrases: literally"));
        assert!(prompt.contains("- Use contractions: true"));
        assert_eq!(prompt, profile.render_instructions().expect("render"));
    }

    #[test]
    fn render_falls_back_to_defaults() {
        let (_dir, profile) = profile_with(json!({}));
        let prompt = profile.render_instructions().expect("render");
        assert!(prompt.contains("- Tone: friendly"));
        assert!(prompt.contains("- Maximum length: 500 characters"));
        assert!(!prompt.contains("Commonly use phrases"));
    }

    #[test]
    fn max_reply_length_defaults_and_overrides() {
        let (_dir, unset) = profile_with(json!({"response_rules": {}}));
        assert_eq!(unset.max_reply_length().unwrap(), 500);

        let (_dir2, set) = profile_with(json!({"response_rules": {"max_length": 140}}));
        assert_eq!(set.max_reply_length().unwrap(), 140);
    }

    #[test]
    fn apply_update_persists_to_disk() {
        let (dir, profile) = profile_with(json!({"personality": {"tone": "formal"}, "name": "Original"}));
        profile
            .apply_update(&json!({"personality": {"tone": "casual"}}))
            .expect("update");

        let reloaded = StyleProfile::load(dir.path().join("my_style.json")).expect("reload");
        assert_eq!(
            reloaded.document().unwrap(),
            json!({"personality": {"tone": "casual"}, "name": "Original"})
        );
        assert!(profile.apply_update(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn add_example_appends_and_persists() {
        let (dir, profile) = profile_with(json!({}));
        profile.add_example("you up?", "ya what's up").expect("add");
        profile.add_example("dinner?", "sure, 7?").expect("add");

        let examples = profile.example_exchanges().unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].prompt, "you up?");
        assert_eq!(examples[1].response, "sure, 7?");

        let reloaded = StyleProfile::load(dir.path().join("my_style.json")).expect("reload");
        assert_eq!(reloaded.example_exchanges().unwrap(), examples);
    }

    #[test]
    fn missing_file_is_seeded_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chat-style").join("my_style.json");
        let profile = StyleProfile::load(&path).expect("load");
        assert!(path.exists());
        assert_eq!(profile.max_reply_length().unwrap(), DEFAULT_MAX_REPLY_LENGTH);
        assert!(profile.example_exchanges().unwrap().is_empty());
    }
}
