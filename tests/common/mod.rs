//! Shared test fixtures: a scripted chat model, a deterministic embedder
//! and a recording client transport, plus context builders.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use memoryx::client::{
    QueuedMemory, QueuedMessage, Registration, TaskAccepted, Transport, TransportError,
};
use memoryx::config::ServerConfig;
use memoryx::handlers::{AppContext, AppState};
use memoryx::llm::{prompts, ChatModel, Embedder, LlmError};
use memoryx::types::{OwnerId, TaskPayload, TaskRecord};

// =============================================================================
// Scripted chat model
// =============================================================================

pub type PromptFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Chat model dispatching on the fixed system prompts. Each hook receives
/// the full user prompt and returns the raw completion. Defaults mimic a
/// cooperative model: whole-text facts with capitalized-word entities,
/// identity summaries and an empty judge verdict (which the reconciler
/// treats as ADD).
pub struct ScriptedChat {
    pub on_facts: RwLock<PromptFn>,
    pub on_entities: RwLock<PromptFn>,
    pub on_judge: RwLock<PromptFn>,
    pub on_summary: RwLock<PromptFn>,
}

/// Consecutive capitalized words, joined: "Zhang San works at Huawei" ->
/// ["Zhang San", "Huawei"].
pub fn capitalized_entities(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        let is_cap = word.chars().next().is_some_and(|c| c.is_uppercase());
        if is_cap {
            current.push(word);
        } else {
            if !current.is_empty() {
                out.push(current.join(" "));
                current.clear();
            }
        }
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }
    out.retain(|e| e.len() > 1);
    out.dedup();
    out
}

/// Pull the `{text}` payload back out of a prompt.
pub fn prompt_payload<'a>(prompt: &'a str, marker: &str) -> &'a str {
    let start = prompt.find(marker).map(|i| i + marker.len()).unwrap_or(0);
    let rest = &prompt[start..];
    match rest.find("\n\nReturn strictly") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

impl Default for ScriptedChat {
    fn default() -> Self {
        let facts: PromptFn = Arc::new(|prompt| {
            let text = prompt_payload(prompt, "Text:\n");
            json!({
                "facts": [{
                    "text": text,
                    "category": "fact",
                    "confidence": 0.9,
                    "entities": capitalized_entities(text),
                }]
            })
            .to_string()
        });
        let entities: PromptFn = Arc::new(|prompt| {
            let text = prompt_payload(prompt, "Text:\n");
            let entities: Vec<_> = capitalized_entities(text)
                .into_iter()
                .map(|name| json!({"name": name, "type": "other"}))
                .collect();
            json!({"entities": entities, "relations": []}).to_string()
        });
        let judge: PromptFn = Arc::new(|_| json!({"memory": []}).to_string());
        let summary: PromptFn =
            Arc::new(|prompt| prompt_payload(prompt, "Conversation:\n").to_string());

        Self {
            on_facts: RwLock::new(facts),
            on_entities: RwLock::new(entities),
            on_judge: RwLock::new(judge),
            on_summary: RwLock::new(summary),
        }
    }
}

impl ScriptedChat {
    pub fn set_judge(&self, hook: impl Fn(&str) -> String + Send + Sync + 'static) {
        *self.on_judge.write() = Arc::new(hook);
    }

    pub fn set_facts(&self, hook: impl Fn(&str) -> String + Send + Sync + 'static) {
        *self.on_facts.write() = Arc::new(hook);
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let hook = if system == prompts::EXTRACT_FACTS_SYSTEM {
            self.on_facts.read().clone()
        } else if system == prompts::EXTRACT_ENTITIES_SYSTEM {
            self.on_entities.read().clone()
        } else if system == prompts::JUDGE_SYSTEM {
            self.on_judge.read().clone()
        } else if system == prompts::SUMMARIZE_SYSTEM {
            self.on_summary.read().clone()
        } else if system == prompts::COMMUNITY_SYSTEM {
            return Ok("A cluster of related entities".to_string());
        } else {
            return Err(LlmError::Permanent(format!("unknown system prompt: {system}")));
        };
        Ok(hook(user))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Chat model that always fails, for retry/failure-path tests.
pub struct FailingChat {
    pub transient: bool,
}

#[async_trait]
impl ChatModel for FailingChat {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
        if self.transient {
            Err(LlmError::Transient("connection refused".to_string()))
        } else {
            Err(LlmError::Permanent("schema mismatch".to_string()))
        }
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

// =============================================================================
// Deterministic embedder
// =============================================================================

/// Embedding fake with registered vectors. Registered texts get exact
/// vectors (so tests control cosine similarity precisely); everything else
/// hashes into a reserved half of the space, roughly orthogonal to the
/// registered basis.
pub struct FakeEmbedder {
    map: Mutex<HashMap<String, Vec<f32>>>,
}

impl FakeEmbedder {
    pub const DIM: usize = 16;
    const BASIS_DIMS: usize = 8;

    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Unit vector along reserved axis `i` (i < 8).
    pub fn basis(i: usize) -> Vec<f32> {
        assert!(i < Self::BASIS_DIMS);
        let mut v = vec![0.0; Self::DIM];
        v[i] = 1.0;
        v
    }

    /// Unit vector at cosine `cos` from `basis(i)`, in the (i, j) plane.
    pub fn blend(i: usize, j: usize, cos: f32) -> Vec<f32> {
        assert!(i < Self::BASIS_DIMS && j < Self::BASIS_DIMS && i != j);
        let mut v = vec![0.0; Self::DIM];
        v[i] = cos;
        v[j] = (1.0 - cos * cos).max(0.0).sqrt();
        v
    }

    pub fn register(&self, text: &str, vector: Vec<f32>) {
        self.map.lock().insert(text.to_string(), vector);
    }

    fn fallback(text: &str) -> Vec<f32> {
        // Simple FNV over the reserved upper half; deterministic and far
        // from every registered basis vector
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in text.bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let mut v = vec![0.0; Self::DIM];
        for k in 0..4 {
            let dim = Self::BASIS_DIMS + ((hash >> (k * 8)) as usize % Self::BASIS_DIMS);
            v[dim] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        if let Some(vector) = self.map.lock().get(text) {
            return Ok(vector.clone());
        }
        Ok(Self::fallback(text))
    }

    fn dimension(&self) -> usize {
        Self::DIM
    }
}

// =============================================================================
// Context builders
// =============================================================================

pub struct TestContext {
    pub state: AppState,
    pub chat: Arc<ScriptedChat>,
    pub embedder: Arc<FakeEmbedder>,
    pub dir: TempDir,
}

/// Full app context over temp stores with scripted models.
pub fn test_context() -> TestContext {
    test_context_with(|_| {})
}

/// Same, with a config hook (encryption keys, thresholds, weights).
pub fn test_context_with(tweak: impl FnOnce(&mut ServerConfig)) -> TestContext {
    let dir = TempDir::new().expect("temp dir");
    let chat = Arc::new(ScriptedChat::default());
    let embedder = Arc::new(FakeEmbedder::new());

    let mut config = ServerConfig {
        data_dir: dir.path().to_path_buf(),
        embed_dim: FakeEmbedder::DIM,
        ..Default::default()
    };
    tweak(&mut config);

    let state = AppContext::new(config, chat.clone(), embedder.clone()).expect("app context");
    TestContext {
        state,
        chat,
        embedder,
        dir,
    }
}

pub fn owner() -> OwnerId {
    OwnerId::new("agent-test", "default")
}

/// Submit a single-memory task and run it to completion synchronously.
pub async fn ingest_text(state: &AppState, owner: &OwnerId, text: &str) -> TaskRecord {
    let task = state
        .queue
        .submit(
            owner.clone(),
            TaskPayload::Memory {
                content: text.to_string(),
                metadata: None,
            },
        )
        .expect("submit task");
    state.worker.process_task(task.clone()).await;
    state
        .queue
        .get(&task.id)
        .expect("load task")
        .expect("task exists")
}

// =============================================================================
// Recording client transport
// =============================================================================

/// Client transport that records deliveries and can be switched to fail.
pub struct RecordingTransport {
    pub memory_batches: Mutex<Vec<Vec<String>>>,
    pub conversations: Mutex<Vec<(String, Vec<QueuedMessage>)>>,
    pub failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            memory_batches: Mutex::new(Vec::new()),
            conversations: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TransportError::Http {
                status: 503,
                body: "server down".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn accepted() -> TaskAccepted {
        TaskAccepted {
            task_id: Some(uuid::Uuid::new_v4().to_string()),
            status: Some("PENDING".to_string()),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_memory(
        &self,
        item: &QueuedMemory,
        _project_id: &str,
    ) -> Result<TaskAccepted, TransportError> {
        self.check()?;
        self.memory_batches
            .lock()
            .push(vec![item.content.clone()]);
        Ok(Self::accepted())
    }

    async fn send_batch(
        &self,
        items: &[QueuedMemory],
        _project_id: &str,
    ) -> Result<TaskAccepted, TransportError> {
        self.check()?;
        self.memory_batches
            .lock()
            .push(items.iter().map(|i| i.content.clone()).collect());
        Ok(Self::accepted())
    }

    async fn send_conversation(
        &self,
        conversation_id: &str,
        messages: &[QueuedMessage],
    ) -> Result<TaskAccepted, TransportError> {
        self.check()?;
        self.conversations
            .lock()
            .push((conversation_id.to_string(), messages.to_vec()));
        Ok(Self::accepted())
    }

    async fn auto_register(
        &self,
        _fingerprint: &str,
        _agent_type: &str,
        _agent_name: &str,
        _platform: &str,
        _platform_version: &str,
    ) -> Result<Registration, TransportError> {
        self.check()?;
        Ok(Registration {
            agent_id: "agent-recording".to_string(),
            api_key: "mx-test-key".to_string(),
            project_id: "default".to_string(),
        })
    }

    fn set_api_key(&self, _api_key: &str) {}
}
