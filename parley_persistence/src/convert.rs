use chrono::{DateTime, Utc};
use parley_core::{AgentConfig, Message, PersistenceError, Role};
use parley_entities::{agents, messages};
use sea_orm::JsonValue;

pub fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| PersistenceError::InvalidRecord(format!("timestamp out of range: {micros}")))
}

pub fn message_from_model(m: messages::Model) -> Result<Message, PersistenceError> {
    let role = m.role.parse::<Role>()?;
    Ok(Message {
        id: m.id,
        conversation_id: m.conversation_id,
        role,
        content: m.content,
        created_at: micros_to_datetime(m.created_at)?,
    })
}

fn tool_blocks_from_json(val: &JsonValue) -> Vec<String> {
    val.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn tool_blocks_to_json(blocks: &[String]) -> JsonValue {
    JsonValue::Array(blocks.iter().cloned().map(JsonValue::String).collect())
}

pub fn agent_from_model(m: agents::Model) -> AgentConfig {
    AgentConfig {
        id: m.id,
        persona: m.persona,
        tool_blocks: tool_blocks_from_json(&m.tool_blocks),
        memory_state: m.memory_state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn converts_message_model() {
        let id = Uuid::now_v7();
        let model = messages::Model {
            seq: 1,
            id,
            conversation_id: Uuid::nil(),
            role: "assistant".to_string(),
            content: "4".to_string(),
            created_at: 1_700_000_000_123_456,
        };

        let message = message_from_model(model);
        assert!(matches!(message, Ok(ref m) if m.id == id && m.role == Role::Assistant));
        assert_eq!(
            message.map(|m| m.created_at.timestamp_micros()).ok(),
            Some(1_700_000_000_123_456)
        );
    }

    #[test]
    fn rejects_unknown_role() {
        let model = messages::Model {
            seq: 2,
            id: Uuid::now_v7(),
            conversation_id: Uuid::nil(),
            role: "system".to_string(),
            content: String::new(),
            created_at: 0,
        };
        assert!(matches!(
            message_from_model(model),
            Err(PersistenceError::InvalidRecord(_))
        ));
    }

    #[test]
    fn tool_blocks_skip_non_strings() {
        let model = agents::Model {
            id: Uuid::nil(),
            persona: "Tutor".to_string(),
            memory_state: json!({"topic": "math"}),
            tool_blocks: json!(["search", 3, "calculator"]),
        };
        let agent = agent_from_model(model);
        assert_eq!(agent.tool_blocks, ["search", "calculator"]);
        assert_eq!(agent.memory_state["topic"], "math");
    }

    #[test]
    fn tool_blocks_json_round_trip() {
        let blocks = vec!["a".to_string(), "b".to_string()];
        assert_eq!(tool_blocks_from_json(&tool_blocks_to_json(&blocks)), blocks);
    }
}
