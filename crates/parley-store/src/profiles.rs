use chrono::Utc;
use tracing::instrument;

use parley_core::ids::AgentId;
use parley_core::profile::AgentProfile;

use crate::database::Database;
use crate::error::StoreError;

/// Persisted agent profiles, validated at session init.
pub struct AgentProfileRepo {
    db: Database,
}

impl AgentProfileRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn exists(&self, agent_id: &AgentId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM agent_profiles WHERE agent_id = ?1 LIMIT 1")?;
            Ok(stmt.exists([agent_id.as_str()])?)
        })
    }

    /// Insert a profile, or replace the stored one for the same agent id.
    #[instrument(skip(self, profile), fields(agent_id = %profile.agent_id))]
    pub fn upsert(&self, profile: &AgentProfile) -> Result<(), StoreError> {
        let json = serde_json::to_string(profile)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agent_profiles (agent_id, profile_json, avatar_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(agent_id) DO UPDATE SET
                     profile_json = excluded.profile_json,
                     avatar_url = excluded.avatar_url,
                     updated_at = excluded.updated_at",
                rusqlite::params![profile.agent_id.as_str(), json, profile.avatar_url, now],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub fn get(&self, agent_id: &AgentId) -> Result<AgentProfile, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT profile_json, avatar_url FROM agent_profiles WHERE agent_id = ?1")?;
            let mut rows = stmt.query([agent_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row.get(0)?;
                    let avatar: Option<String> = row.get(1)?;
                    let mut profile: AgentProfile = serde_json::from_str(&raw)?;
                    profile.agent_id = agent_id.clone();
                    if avatar.is_some() {
                        profile.avatar_url = avatar;
                    }
                    Ok(profile)
                }
                None => Err(StoreError::NotFound(format!("agent profile {agent_id}"))),
            }
        })
    }

    /// All stored profiles, oldest first.
    pub fn list(&self) -> Result<Vec<AgentProfile>, StoreError> {
        let raws: Vec<String> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT profile_json FROM agent_profiles ORDER BY created_at, agent_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let raws = rows.collect::<Result<Vec<String>, rusqlite::Error>>()?;
            Ok(raws)
        })?;
        raws.iter()
            .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> AgentProfileRepo {
        AgentProfileRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn upsert_then_get() {
        let repo = repo();
        let mut profile = AgentProfile::new(AgentId::from_raw("agent_a"), "Aki");
        profile.supports_tools = true;
        repo.upsert(&profile).unwrap();

        assert!(repo.exists(&profile.agent_id).unwrap());
        let loaded = repo.get(&profile.agent_id).unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn upsert_replaces_existing() {
        let repo = repo();
        let mut profile = AgentProfile::new(AgentId::from_raw("agent_a"), "Aki");
        repo.upsert(&profile).unwrap();
        profile.name = "Aki v2".into();
        profile.avatar_url = Some("https://cdn/a.png".into());
        repo.upsert(&profile).unwrap();

        let loaded = repo.get(&profile.agent_id).unwrap();
        assert_eq!(loaded.name, "Aki v2");
        assert_eq!(loaded.avatar_url.as_deref(), Some("https://cdn/a.png"));
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn missing_profile_is_not_found() {
        let repo = repo();
        let id = AgentId::from_raw("ghost");
        assert!(!repo.exists(&id).unwrap());
        assert!(matches!(repo.get(&id), Err(StoreError::NotFound(_))));
    }
}
