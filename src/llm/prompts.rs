//! Fixed prompt templates for the ingestion pipeline.
//!
//! These strings define the structured output schemas the extraction layer
//! parses; they are part of the external interface of the ingestion layer
//! and MUST stay stable across versions. Any change here is a breaking
//! change to ingestion behavior.

/// System prompt for conversation summarization.
pub const SUMMARIZE_SYSTEM: &str = "You are a conversation summarizer. Condense \
the conversation while keeping every concrete fact; drop greetings, filler and \
repetition.";

/// Summarization instruction; `{transcript}` is the role-tagged conversation.
pub fn summarize_prompt(transcript: &str) -> String {
    format!(
        "Summarize the following conversation.\n\
         \n\
         Rules:\n\
         1. Keep every important fact: preferences, personal details, work, plans.\n\
         2. Keep concrete times, places, people and events.\n\
         3. Drop greetings, small talk and repeated content.\n\
         4. Keep chronological order, in concise plain language.\n\
         5. Return only the summary text, nothing else.\n\
         \n\
         Conversation:\n{transcript}"
    )
}

/// System prompt for fact extraction.
pub const EXTRACT_FACTS_SYSTEM: &str = "You are a memory extraction assistant. \
Extract independent atomic facts from the text and return only JSON.";

/// Fact extraction instruction. The model must return:
/// `{"facts":[{"text":"...","category":"...","confidence":0.8,"entities":["..."]}]}`
/// with category one of preference, fact, plan, experience, opinion,
/// correction, other.
pub fn extract_facts_prompt(text: &str) -> String {
    format!(
        "Extract all independent facts from the following text.\n\
         \n\
         Rules:\n\
         1. Split complex sentences into simple, self-contained atomic facts.\n\
         2. Each fact must be a complete statement that stands alone.\n\
         3. Drop greetings, filler and content with no durable information.\n\
         4. Classify each fact: preference, fact, plan, experience, opinion, correction, other.\n\
         5. Give a confidence between 0 and 1 for each fact.\n\
         6. List the named entities (people, places, organizations, technologies, things) each fact mentions.\n\
         7. Detect the input language and record facts in the same language.\n\
         \n\
         Example:\n\
         Input: \"John works at Google in Mountain View. He loves playing tennis on weekends.\"\n\
         Output: {{\n\
           \"facts\": [\n\
             {{\"text\": \"John works at Google\", \"category\": \"fact\", \"confidence\": 0.9, \"entities\": [\"John\", \"Google\"]}},\n\
             {{\"text\": \"John works in Mountain View\", \"category\": \"fact\", \"confidence\": 0.8, \"entities\": [\"John\", \"Mountain View\"]}},\n\
             {{\"text\": \"John loves playing tennis on weekends\", \"category\": \"preference\", \"confidence\": 0.9, \"entities\": [\"John\", \"tennis\"]}}\n\
           ]\n\
         }}\n\
         \n\
         Input with no durable information returns {{\"facts\": []}}.\n\
         \n\
         Text:\n{text}\n\
         \n\
         Return strictly this JSON shape:\n\
         {{\"facts\": [{{\"text\": \"...\", \"category\": \"...\", \"confidence\": 0.0, \"entities\": [\"...\"]}}]}}"
    )
}

/// System prompt for entity/relation extraction.
pub const EXTRACT_ENTITIES_SYSTEM: &str = "You are an entity and relation \
extraction assistant. Extract entities and their relations precisely and \
return only JSON.";

/// Entity/relation extraction instruction. The model must return:
/// `{"entities":[{"name":"...","type":"..."}],"relations":[{"source":"...","relation":"...","target":"..."}]}`
pub fn extract_entities_prompt(text: &str) -> String {
    format!(
        "Extract all entities and the relations between them from the text.\n\
         \n\
         Rules:\n\
         1. Entity types: person, location, organization, technology, concept, event, item, skill.\n\
         2. Relation types are verbs or short phrases (works_at, lives_in, likes, learning).\n\
         3. If the text uses first person (I, me, my), use \"USER\" as the entity name.\n\
         4. Detect the input language and record entities in the same language.\n\
         \n\
         Example:\n\
         Input: \"John lives in New York and works at Microsoft.\"\n\
         Output: {{\n\
           \"entities\": [\n\
             {{\"name\": \"John\", \"type\": \"person\"}},\n\
             {{\"name\": \"New York\", \"type\": \"location\"}},\n\
             {{\"name\": \"Microsoft\", \"type\": \"organization\"}}\n\
           ],\n\
           \"relations\": [\n\
             {{\"source\": \"John\", \"relation\": \"lives_in\", \"target\": \"New York\"}},\n\
             {{\"source\": \"John\", \"relation\": \"works_at\", \"target\": \"Microsoft\"}}\n\
           ]\n\
         }}\n\
         \n\
         Text:\n{text}\n\
         \n\
         Return strictly this JSON shape, nothing else:\n\
         {{\"entities\": [{{\"name\": \"...\", \"type\": \"...\"}}], \"relations\": [{{\"source\": \"...\", \"relation\": \"...\", \"target\": \"...\"}}]}}"
    )
}

/// System prompt for the memory-update judge.
pub const JUDGE_SYSTEM: &str = "You are a memory manager. Compare new facts \
against existing memories, decide one operation per item and return only JSON.";

/// Judge instruction: decide ADD / UPDATE / DELETE / NONE for each new fact
/// against the retrieved neighbor memories. `existing_json` is a JSON array
/// of `{"id","text"}` objects; `facts_json` a JSON array of strings.
pub fn judge_prompt(existing_json: &str, facts_json: &str) -> String {
    format!(
        "You manage a user's memory store. Four operations exist:\n\
         \n\
         1. ADD - the fact is new information not present in memory.\n\
         2. UPDATE - the fact refines or corrects an existing memory about the \
         same subject. Use the existing memory's id and rewrite its text.\n\
         3. DELETE - the fact explicitly negates an existing memory \
         (\"no longer\", \"not ... anymore\", \"used to ... but now\"). \
         Use the existing memory's id.\n\
         4. NONE - the fact duplicates an existing memory; nothing changes.\n\
         \n\
         Rules:\n\
         - ADD entries get a new incremental id.\n\
         - UPDATE and DELETE must reuse an existing memory id.\n\
         - Every entry carries a short reason.\n\
         - A fact that negates one memory and states a new one produces a \
         DELETE for the old id and an ADD for the new fact.\n\
         - Return only JSON.\n\
         \n\
         Existing memories:\n```\n{existing_json}\n```\n\
         \n\
         New facts:\n```\n{facts_json}\n```\n\
         \n\
         Return strictly this JSON shape:\n\
         {{\"memory\": [{{\"id\": \"<id>\", \"text\": \"<memory text>\", \
         \"event\": \"<ADD/UPDATE/DELETE/NONE>\", \"old_memory\": \
         \"<only for UPDATE>\", \"reason\": \"<why>\"}}]}}"
    )
}

/// System prompt for community summarization.
pub const COMMUNITY_SYSTEM: &str = "You write one-sentence summaries of entity \
clusters. Return only the sentence.";

/// Community summary instruction over the member entity names.
pub fn community_prompt(entity_names: &str) -> String {
    format!(
        "These entities form a densely connected cluster in a user's memory \
         graph:\n{entity_names}\n\
         \n\
         Describe in one short sentence what this cluster is about."
    )
}
