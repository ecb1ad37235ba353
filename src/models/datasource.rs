use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DataSource {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub dsn: String,
    pub max_connections: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDataSource {
    pub name: String,
    pub dsn: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: i32,
}

fn default_max_connections() -> i32 {
    5
}
