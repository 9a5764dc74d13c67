use crate::types::{AnnouncementType, Environment, SchemaId};

/// Finite `(environment, announcement type) -> schema id` table, resolved
/// once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaRegistry {
    environment: Environment,
}

impl SchemaRegistry {
    pub fn for_environment(environment: Environment) -> Self {
        Self { environment }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn schema_id(&self, kind: AnnouncementType) -> SchemaId {
        // Dev chains register the profile schema before update.
        let id = match (self.environment, kind) {
            (_, AnnouncementType::Tombstone) => 1,
            (_, AnnouncementType::Broadcast) => 2,
            (_, AnnouncementType::Reply) => 3,
            (_, AnnouncementType::Reaction) => 4,
            (Environment::Dev, AnnouncementType::Profile) => 5,
            (Environment::Dev, AnnouncementType::Update) => 6,
            (_, AnnouncementType::Update) => 5,
            (_, AnnouncementType::Profile) => 6,
        };
        SchemaId(id)
    }
}
