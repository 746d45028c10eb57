//! Input validation at the API boundary.

use anyhow::{anyhow, Result};
use uuid::Uuid;

pub const MAX_USER_ID_LENGTH: usize = 128;
pub const MAX_PROJECT_ID_LENGTH: usize = 128;
pub const MAX_CONTENT_LENGTH: usize = 50_000; // 50KB
pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_MESSAGES_PER_SEGMENT: usize = 500;
pub const MAX_LIST_LIMIT: usize = 500;
/// Queries shorter than this return empty results without charging quota.
pub const MIN_QUERY_LENGTH: usize = 2;

/// Validate a user or agent id.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(anyhow!("user_id cannot be empty"));
    }

    if user_id.len() > MAX_USER_ID_LENGTH {
        return Err(anyhow!(
            "user_id too long: {} chars (max: {})",
            user_id.len(),
            MAX_USER_ID_LENGTH
        ));
    }

    if !user_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '@' || c == '.')
    {
        return Err(anyhow!(
            "user_id contains invalid characters (allowed: alphanumeric, -, _, @, .)"
        ));
    }

    Ok(())
}

/// Validate a project id (same character rules as user ids).
pub fn validate_project_id(project_id: &str) -> Result<()> {
    if project_id.is_empty() {
        return Err(anyhow!("project_id cannot be empty"));
    }
    if project_id.len() > MAX_PROJECT_ID_LENGTH {
        return Err(anyhow!(
            "project_id too long: {} chars (max: {})",
            project_id.len(),
            MAX_PROJECT_ID_LENGTH
        ));
    }
    if !project_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(anyhow!("project_id contains invalid characters"));
    }
    Ok(())
}

/// Validate memory content.
pub fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(anyhow!("content cannot be empty"));
    }

    if content.len() > MAX_CONTENT_LENGTH {
        return Err(anyhow!(
            "content too long: {} bytes (max: {})",
            content.len(),
            MAX_CONTENT_LENGTH
        ));
    }

    Ok(())
}

/// Validate a memory id path parameter (UUID format).
pub fn validate_memory_id(memory_id: &str) -> Result<Uuid> {
    Uuid::parse_str(memory_id).map_err(|e| anyhow!("Invalid memory_id UUID format: {e}"))
}

/// Validate a conversation segment id.
pub fn validate_conversation_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("conversation_id cannot be empty"));
    }
    if id.len() > 256 {
        return Err(anyhow!("conversation_id too long (max: 256)"));
    }
    Ok(())
}

/// Validate an embedding vector against the deploy-time dimension.
pub fn validate_embedding(embedding: &[f32], expected_dim: usize) -> Result<()> {
    if embedding.len() != expected_dim {
        return Err(anyhow!(
            "embedding dimension mismatch: got {}, expected {}",
            embedding.len(),
            expected_dim
        ));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("embedding contains NaN or Inf values"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_rules() {
        assert!(validate_user_id("agent-01").is_ok());
        assert!(validate_user_id("a@b.c").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("bad id with spaces").is_err());
        assert!(validate_user_id(&"x".repeat(200)).is_err());
    }

    #[test]
    fn content_rules() {
        assert!(validate_content("Zhang San works at Huawei").is_ok());
        assert!(validate_content("   ").is_err());
        assert!(validate_content(&"x".repeat(MAX_CONTENT_LENGTH + 1)).is_err());
    }

    #[test]
    fn embedding_rules() {
        assert!(validate_embedding(&[0.1, 0.2, 0.3], 3).is_ok());
        assert!(validate_embedding(&[0.1, 0.2], 3).is_err());
        assert!(validate_embedding(&[0.1, f32::NAN, 0.3], 3).is_err());
    }
}
