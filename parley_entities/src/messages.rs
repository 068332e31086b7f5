use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One persisted chat message.
///
/// `seq` is assigned by the database on insert and only ever grows, so the
/// insert feed can poll on it regardless of writer clocks. `created_at`
/// holds microseconds since the Unix epoch and defines render order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "messages")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub seq: i64,
    #[sea_orm(unique)]
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    #[sea_orm(column_type = "Text")]
    pub content: String,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
