//! Structured extraction over the chat model: facts, entities/relations,
//! the memory-update judge and conversation summaries.
//!
//! Responses are parsed from the widest `{...}` slice of the completion, so
//! models that wrap JSON in prose still parse. Parse failures degrade the
//! way the pipeline expects: fact extraction falls back to one whole-text
//! fact, graph extraction to empty, the judge to ADD-everything.

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::prompts;
use super::{ChatModel, LlmError};
use crate::store::graph::EntityLabel;
use crate::types::{Category, RelationTriple};

/// One extracted fact before reconciliation.
#[derive(Debug, Clone)]
pub struct RawFact {
    pub text: String,
    pub category: Category,
    pub confidence: f32,
    pub entities: Vec<String>,
}

/// Entities and relations extracted from one fact.
#[derive(Debug, Clone, Default)]
pub struct ExtractedGraph {
    pub entities: Vec<(String, EntityLabel)>,
    pub relations: Vec<RelationTriple>,
}

/// Judge verdict for one memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeEvent {
    Add,
    Update,
    Delete,
    None,
}

impl JudgeEvent {
    fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "ADD" => Self::Add,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::None,
        }
    }
}

/// One judge operation.
#[derive(Debug, Clone)]
pub struct JudgeOp {
    pub id: String,
    pub text: String,
    pub event: JudgeEvent,
    pub reason: String,
}

/// Neighbor memory shown to the judge.
#[derive(Debug, Clone)]
pub struct NeighborView {
    pub id: String,
    pub text: String,
}

/// Widest `{...}` slice of a completion; tolerates prose around the JSON.
fn json_slice(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end > start {
        Some(&response[start..=end])
    } else {
        None
    }
}

#[derive(Deserialize)]
struct FactsEnvelope {
    #[serde(default)]
    facts: Vec<FactItem>,
}

#[derive(Deserialize)]
struct FactItem {
    #[serde(alias = "content")]
    text: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    entities: Vec<String>,
}

#[derive(Deserialize)]
struct GraphEnvelope {
    #[serde(default)]
    entities: Vec<GraphEntity>,
    #[serde(default)]
    relations: Vec<GraphRelation>,
}

#[derive(Deserialize)]
struct GraphEntity {
    name: String,
    #[serde(rename = "type", default)]
    entity_type: Option<String>,
}

#[derive(Deserialize)]
struct GraphRelation {
    source: String,
    #[serde(alias = "predicate")]
    relation: String,
    target: String,
}

#[derive(Deserialize)]
struct JudgeEnvelope {
    #[serde(default)]
    memory: Vec<JudgeItem>,
}

#[derive(Deserialize)]
struct JudgeItem {
    #[serde(default)]
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    reason: String,
}

/// Extraction facade over a chat model.
pub struct FactExtractor {
    chat: Arc<dyn ChatModel>,
}

impl FactExtractor {
    pub fn new(chat: Arc<dyn ChatModel>) -> Self {
        Self { chat }
    }

    /// Summarize a role-tagged transcript into a compact factual narrative.
    pub async fn summarize(&self, transcript: &str) -> Result<String, LlmError> {
        let response = self
            .chat
            .complete(
                prompts::SUMMARIZE_SYSTEM,
                &prompts::summarize_prompt(transcript),
            )
            .await?;
        let summary = response.trim();
        if summary.is_empty() {
            // An empty summary would silently drop the segment
            Ok(transcript.to_string())
        } else {
            Ok(summary.to_string())
        }
    }

    /// Extract atomic facts. A parse failure degrades to one whole-text
    /// fact rather than losing the input.
    pub async fn extract_facts(&self, text: &str) -> Result<Vec<RawFact>, LlmError> {
        let response = self
            .chat
            .complete(
                prompts::EXTRACT_FACTS_SYSTEM,
                &prompts::extract_facts_prompt(text),
            )
            .await?;

        let parsed = json_slice(&response)
            .and_then(|slice| serde_json::from_str::<FactsEnvelope>(slice).ok());

        let Some(envelope) = parsed else {
            tracing::warn!("Fact extraction returned unparseable JSON, keeping whole text");
            return Ok(vec![RawFact {
                text: text.to_string(),
                category: Category::Fact,
                confidence: 0.5,
                entities: Vec::new(),
            }]);
        };

        Ok(envelope
            .facts
            .into_iter()
            .filter(|f| !f.text.trim().is_empty())
            .map(|f| RawFact {
                text: f.text.trim().to_string(),
                category: f
                    .category
                    .as_deref()
                    .map(Category::parse)
                    .unwrap_or(Category::Other),
                confidence: f.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                entities: f.entities,
            })
            .collect())
    }

    /// Extract typed entities and relations from one fact. First-person
    /// references resolve to the owning user id. Parse failures yield an
    /// empty graph (the fact still carries its extractor entity list).
    pub async fn extract_graph(&self, text: &str, user_id: &str) -> Result<ExtractedGraph, LlmError> {
        let response = self
            .chat
            .complete(
                prompts::EXTRACT_ENTITIES_SYSTEM,
                &prompts::extract_entities_prompt(text),
            )
            .await?;

        let parsed = json_slice(&response)
            .and_then(|slice| serde_json::from_str::<GraphEnvelope>(slice).ok());

        let Some(envelope) = parsed else {
            tracing::debug!("Entity extraction returned unparseable JSON");
            return Ok(ExtractedGraph::default());
        };

        let resolve = |name: &str| -> String {
            if name.eq_ignore_ascii_case("USER") || name.eq_ignore_ascii_case("USER_ID") {
                user_id.to_string()
            } else {
                name.to_string()
            }
        };

        Ok(ExtractedGraph {
            entities: envelope
                .entities
                .into_iter()
                .filter(|e| !e.name.trim().is_empty())
                .map(|e| {
                    (
                        resolve(e.name.trim()),
                        e.entity_type
                            .as_deref()
                            .map(EntityLabel::parse)
                            .unwrap_or(EntityLabel::Other),
                    )
                })
                .collect(),
            relations: envelope
                .relations
                .into_iter()
                .filter(|r| !r.source.trim().is_empty() && !r.target.trim().is_empty())
                .map(|r| RelationTriple {
                    source: resolve(r.source.trim()),
                    predicate: r.relation.trim().to_lowercase().replace(' ', "_"),
                    target: resolve(r.target.trim()),
                })
                .collect(),
        })
    }

    /// Ask the judge to decide ADD / UPDATE / DELETE / NONE per fact against
    /// the neighbor memories. A parse failure falls back to adding every
    /// fact, which keeps ingestion lossless at the cost of duplicates the
    /// next reconciliation can clean up.
    pub async fn judge(
        &self,
        existing: &[NeighborView],
        facts: &[String],
    ) -> Result<Vec<JudgeOp>, LlmError> {
        let existing_json = serde_json::to_string_pretty(
            &existing
                .iter()
                .map(|n| json!({"id": n.id, "text": n.text}))
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());
        let facts_json =
            serde_json::to_string_pretty(facts).unwrap_or_else(|_| "[]".to_string());

        let response = self
            .chat
            .complete(
                prompts::JUDGE_SYSTEM,
                &prompts::judge_prompt(&existing_json, &facts_json),
            )
            .await?;

        let parsed = json_slice(&response)
            .and_then(|slice| serde_json::from_str::<JudgeEnvelope>(slice).ok());

        let Some(envelope) = parsed else {
            tracing::warn!("Judge returned unparseable JSON, defaulting to ADD for all facts");
            return Ok(facts
                .iter()
                .enumerate()
                .map(|(i, fact)| JudgeOp {
                    id: (existing.len() + i).to_string(),
                    text: fact.clone(),
                    event: JudgeEvent::Add,
                    reason: "default add (judge response unparseable)".to_string(),
                })
                .collect());
        };

        Ok(envelope
            .memory
            .into_iter()
            .map(|item| JudgeOp {
                id: item.id,
                text: item.text,
                event: JudgeEvent::parse(&item.event),
                reason: item.reason,
            })
            .collect())
    }

    /// One-sentence community summary over member entity names.
    pub async fn summarize_community(&self, entity_names: &[String]) -> Result<String, LlmError> {
        let response = self
            .chat
            .complete(
                prompts::COMMUNITY_SYSTEM,
                &prompts::community_prompt(&entity_names.join(", ")),
            )
            .await?;
        Ok(response.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Chat model returning a fixed response.
    struct Fixed(String);

    #[async_trait]
    impl ChatModel for Fixed {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            Ok(self.0.clone())
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    fn extractor(response: &str) -> FactExtractor {
        FactExtractor::new(Arc::new(Fixed(response.to_string())))
    }

    #[tokio::test]
    async fn parses_facts_with_categories_and_entities() {
        let response = r#"Here you go:
        {"facts": [
            {"text": "Zhang San works at Huawei", "category": "fact", "confidence": 0.9, "entities": ["Zhang San", "Huawei"]},
            {"text": "Zhang San likes coffee", "category": "preference", "entities": ["Zhang San", "coffee"]}
        ]}"#;
        let facts = extractor(response).extract_facts("input").await.unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].category, Category::Fact);
        assert_eq!(facts[1].category, Category::Preference);
        assert!((facts[1].confidence - 0.5).abs() < f32::EPSILON); // default
        assert_eq!(facts[0].entities, vec!["Zhang San", "Huawei"]);
    }

    #[tokio::test]
    async fn unparseable_facts_fall_back_to_whole_text() {
        let facts = extractor("no json here").extract_facts("the input").await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].text, "the input");
        assert_eq!(facts[0].category, Category::Fact);
    }

    #[tokio::test]
    async fn graph_extraction_resolves_first_person() {
        let response = r#"{"entities": [{"name": "USER", "type": "person"}, {"name": "Shanghai", "type": "location"}],
                           "relations": [{"source": "USER", "relation": "lives in", "target": "Shanghai"}]}"#;
        let graph = extractor(response).extract_graph("text", "agent-7").await.unwrap();
        assert_eq!(graph.entities[0].0, "agent-7");
        assert_eq!(graph.relations[0].source, "agent-7");
        assert_eq!(graph.relations[0].predicate, "lives_in");
    }

    #[tokio::test]
    async fn judge_parses_events() {
        let response = r#"{"memory": [
            {"id": "0", "text": "old fact", "event": "NONE", "reason": "unrelated"},
            {"id": "1", "text": "new fact", "event": "ADD", "reason": "new info"},
            {"id": "0", "text": "", "event": "DELETE", "reason": "negated"}
        ]}"#;
        let ops = extractor(response)
            .judge(&[], &["new fact".to_string()])
            .await
            .unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].event, JudgeEvent::None);
        assert_eq!(ops[1].event, JudgeEvent::Add);
        assert_eq!(ops[2].event, JudgeEvent::Delete);
    }

    #[tokio::test]
    async fn judge_fallback_adds_everything() {
        let ops = extractor("garbage")
            .judge(
                &[NeighborView {
                    id: "0".to_string(),
                    text: "existing".to_string(),
                }],
                &["fact a".to_string(), "fact b".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.event == JudgeEvent::Add));
        assert_eq!(ops[0].id, "1");
        assert_eq!(ops[1].id, "2");
    }
}
