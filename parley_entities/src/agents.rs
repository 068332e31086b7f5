use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Agent configuration owned by the builder UI; read-only for chat.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub persona: String,
    pub memory_state: Json,
    /// JSON array of capability identifiers
    pub tool_blocks: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
