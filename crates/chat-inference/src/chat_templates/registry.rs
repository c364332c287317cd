//! Template registry
//!
//! Loads every template definition once per engine namespace, compiles the
//! name patterns, and keeps a match list sorted by priority (then by
//! registration order) so a lookup is a single deterministic pass.

use super::template::{EngineKind, Template, TemplateFile, FALLBACK_TEMPLATE};
use crate::error::InferenceError;
use include_dir::{include_dir, Dir};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// `templates/<engine-tag>/*.json`, compiled into the binary.
static EMBEDDED_TEMPLATES: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/templates");

#[derive(Debug, Clone)]
pub enum TemplateSource {
    /// Definitions compiled into the binary.
    Embedded,
    /// `<dir>/<engine-tag>/*.json` on disk.
    Directory(PathBuf),
}

struct CompiledTemplate {
    template: Arc<Template>,
    matchers: Vec<Regex>,
    order: usize,
}

#[derive(Default)]
struct EngineIndex {
    by_name: HashMap<String, Arc<Template>>,
    registration: Vec<String>,
    match_list: Vec<CompiledTemplate>,
}

struct TemplateIndex {
    engines: HashMap<EngineKind, EngineIndex>,
}

pub struct TemplateRegistry {
    source: TemplateSource,
    index: OnceLock<TemplateIndex>,
}

impl TemplateRegistry {
    pub fn new(source: TemplateSource) -> Self {
        Self {
            source,
            index: OnceLock::new(),
        }
    }

    pub fn embedded() -> Self {
        Self::new(TemplateSource::Embedded)
    }

    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self::new(TemplateSource::Directory(dir.into()))
    }

    /// Builds the index. Later calls are no-ops; returns the number of
    /// registered templates across all engines.
    pub fn load_all(&self) -> usize {
        self.index()
            .engines
            .values()
            .map(|e| e.registration.len())
            .sum()
    }

    /// Best matching template for `model_name`, falling back to `chatml` and
    /// then to a synthesized ChatML template. Never fails.
    pub fn resolve(&self, model_name: &str, engine: EngineKind) -> Arc<Template> {
        if let Some(template) = self.find(model_name, engine) {
            return template;
        }

        match self.get(FALLBACK_TEMPLATE, engine) {
            Ok(template) => {
                debug!("No template matched '{}' for {}, using {}", model_name, engine, FALLBACK_TEMPLATE);
                template
            }
            Err(_) => {
                warn!(
                    "No template matched '{}' and {} has no '{}' definition; using built-in ChatML",
                    model_name, engine, FALLBACK_TEMPLATE
                );
                Arc::new(Template::synthesized_fallback(engine))
            }
        }
    }

    /// Best matching template without any fallback.
    pub fn find(&self, model_name: &str, engine: EngineKind) -> Option<Arc<Template>> {
        let candidate = model_name.to_lowercase();
        let index = self.index().engines.get(&engine)?;

        let hit = index
            .match_list
            .iter()
            .find(|c| c.matchers.iter().any(|m| m.is_match(&candidate)))?;

        debug!(
            "Matched '{}' to template '{}' ({}, priority {}, order {})",
            model_name, hit.template.name, engine, hit.template.priority, hit.order
        );
        Some(hit.template.clone())
    }

    /// Direct lookup by template name.
    pub fn get(&self, name: &str, engine: EngineKind) -> Result<Arc<Template>, InferenceError> {
        self.index()
            .engines
            .get(&engine)
            .and_then(|e| e.by_name.get(name))
            .cloned()
            .ok_or_else(|| InferenceError::TemplateNotFound {
                name: name.to_string(),
                engine,
            })
    }

    /// Template names in registration order.
    pub fn list(&self, engine: EngineKind) -> Vec<String> {
        self.index()
            .engines
            .get(&engine)
            .map(|e| e.registration.clone())
            .unwrap_or_default()
    }

    fn index(&self) -> &TemplateIndex {
        self.index.get_or_init(|| {
            let mut engines = HashMap::new();
            for engine in EngineKind::ALL {
                let documents = match &self.source {
                    TemplateSource::Embedded => embedded_documents(engine),
                    TemplateSource::Directory(dir) => directory_documents(dir, engine),
                };
                let index = build_engine_index(engine, documents);
                info!("Loaded {} templates for {}", index.registration.len(), engine);
                engines.insert(engine, index);
            }
            TemplateIndex { engines }
        })
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::embedded()
    }
}

/// (label, contents) pairs sorted by file name.
fn embedded_documents(engine: EngineKind) -> Vec<(String, String)> {
    let Some(dir) = EMBEDDED_TEMPLATES.get_dir(engine.tag()) else {
        warn!("No embedded templates for {}", engine);
        return Vec::new();
    };

    let mut documents: Vec<(String, String)> = dir
        .files()
        .filter(|f| f.path().extension().map_or(false, |e| e == "json"))
        .filter_map(|f| {
            let label = f.path().display().to_string();
            match f.contents_utf8() {
                Some(contents) => Some((label, contents.to_string())),
                None => {
                    warn!("Skipping template {}: not UTF-8", label);
                    None
                }
            }
        })
        .collect();
    documents.sort_by(|a, b| a.0.cmp(&b.0));
    documents
}

fn directory_documents(root: &Path, engine: EngineKind) -> Vec<(String, String)> {
    let dir = root.join(engine.tag());
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Template directory {} unreadable: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |e| e == "json"))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| match std::fs::read_to_string(&path) {
            Ok(contents) => Some((path.display().to_string(), contents)),
            Err(e) => {
                warn!("Skipping template {}: {}", path.display(), e);
                None
            }
        })
        .collect()
}

fn build_engine_index(engine: EngineKind, documents: Vec<(String, String)>) -> EngineIndex {
    let mut index = EngineIndex::default();

    for (label, contents) in documents {
        let file: TemplateFile = match serde_json::from_str(&contents) {
            Ok(file) => file,
            Err(e) => {
                warn!("Skipping template {}: {}", label, e);
                continue;
            }
        };

        match file.engine.as_deref() {
            Some(tag) if tag == engine.tag() => {}
            Some(tag) => {
                warn!("Skipping template {}: engine '{}' does not match namespace {}", label, tag, engine);
                continue;
            }
            None => {
                warn!("Skipping template {}: missing engine", label);
                continue;
            }
        }

        if index.by_name.contains_key(&file.name) {
            warn!("Skipping template {}: duplicate name '{}' for {}", label, file.name, engine);
            continue;
        }

        let matchers = match compile_patterns(&file.patterns) {
            Ok(matchers) => matchers,
            Err(e) => {
                warn!("Skipping template {}: bad pattern: {}", label, e);
                continue;
            }
        };

        let template = Arc::new(file.into_template(engine));
        let order = index.registration.len();
        index.registration.push(template.name.clone());
        index.by_name.insert(template.name.clone(), template.clone());
        index.match_list.push(CompiledTemplate {
            template,
            matchers,
            order,
        });
    }

    index.match_list.sort_by(|a, b| {
        b.template
            .priority
            .cmp(&a.template.priority)
            .then(a.order.cmp(&b.order))
    });
    index
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_templates::template::SpecialHandling;
    use std::fs;

    #[test]
    fn resolves_llama2_gguf_name() {
        let registry = TemplateRegistry::embedded();
        let t = registry.resolve("llama-2-7b-chat.Q4_K_M.gguf", EngineKind::LlamaCpp);
        assert_eq!(t.name, "llama2");
        assert_eq!(t.prompt.special_handling, SpecialHandling::SystemFirstUserMerge);
    }

    #[test]
    fn higher_priority_beats_generic_chat() {
        let registry = TemplateRegistry::embedded();
        let t = registry.resolve("TinyLlama-1.1B-chat", EngineKind::LlamaCpp);
        assert_eq!(t.name, "llama1");
        assert_eq!(t.priority, 8);
    }

    #[test]
    fn unknown_name_falls_back_to_chatml() {
        let registry = TemplateRegistry::embedded();
        let t = registry.resolve("totally-unknown-xyz", EngineKind::LlamaCpp);
        assert_eq!(t.name, "chatml");
        assert!(registry.find("totally-unknown-xyz", EngineKind::LlamaCpp).is_none());
    }

    #[test]
    fn equal_priority_tie_goes_to_first_registered() {
        let registry = TemplateRegistry::embedded();
        // chatml and mistral both match at priority 10; chatml.json sorts first.
        let t = registry.resolve("dolphin-2.6-mistral-7b.Q5_K_M.gguf", EngineKind::LlamaCpp);
        assert_eq!(t.name, "chatml");
    }

    #[test]
    fn engines_are_separate_namespaces() {
        let registry = TemplateRegistry::embedded();
        assert!(registry.get("t5", EngineKind::Transformers).is_ok());
        assert!(matches!(
            registry.get("t5", EngineKind::LlamaCpp),
            Err(InferenceError::TemplateNotFound { .. })
        ));
        let bart = registry.resolve("facebook/bart-large-cnn", EngineKind::Transformers);
        assert_eq!(bart.prompt.special_handling, SpecialHandling::T5Concatenate);
    }

    #[test]
    fn load_all_is_idempotent() {
        let registry = TemplateRegistry::embedded();
        let first = registry.load_all();
        assert!(first > 0);
        assert_eq!(registry.load_all(), first);
        let names = registry.list(EngineKind::LlamaCpp);
        assert_eq!(names.first().map(String::as_str), Some("alpaca"));
        assert!(names.contains(&"llama3".to_string()));
    }

    fn write(dir: &Path, file: &str, body: &str) {
        fs::write(dir.join(file), body).unwrap();
    }

    #[test]
    fn directory_source_skips_bad_files_and_keeps_order() {
        let root = tempfile::tempdir().unwrap();
        let llama = root.path().join("llama-cpp");
        fs::create_dir_all(&llama).unwrap();

        write(&llama, "a_first.json", r#"{"name":"first","engine":"llama-cpp","patterns":["shared"],"priority":5}"#);
        write(&llama, "b_second.json", r#"{"name":"second","engine":"llama-cpp","patterns":["shared"],"priority":5}"#);
        write(&llama, "c_foreign.json", r#"{"name":"foreign","engine":"transformers","patterns":["shared"],"priority":50}"#);
        write(&llama, "d_badregex.json", r#"{"name":"badregex","engine":"llama-cpp","patterns":["("],"priority":50}"#);
        write(&llama, "e_noengine.json", r#"{"name":"noengine","patterns":["shared"],"priority":50}"#);
        write(&llama, "f_dup.json", r#"{"name":"first","engine":"llama-cpp","patterns":["other"],"priority":1}"#);
        write(&llama, "g_broken.json", "{ not json");
        write(&llama, "notes.txt", "ignored");

        let registry = TemplateRegistry::from_dir(root.path());
        assert_eq!(registry.list(EngineKind::LlamaCpp), vec!["first", "second"]);
        assert_eq!(registry.resolve("my-SHARED-model", EngineKind::LlamaCpp).name, "first");

        // No chatml on disk: synthesized fallback.
        let fallback = registry.resolve("nothing", EngineKind::LlamaCpp);
        assert_eq!(fallback.name, "chatml");
        assert_eq!(fallback.stop_tokens, vec!["<|im_end|>"]);

        // Missing engine directory is an empty namespace, not an error.
        assert!(registry.list(EngineKind::Transformers).is_empty());
    }
}
