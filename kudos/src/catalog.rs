//! Product data: levels, badges, missions and the action registry.
//!
//! The catalog is loaded once at startup (usually from YAML), validated, and
//! indexed so that every hot-path lookup is a hash probe:
//!
//! - `ActionKey -> ActionRule` (points + counters fed by the action)
//! - `RequirementType -> [Badge]`
//! - `RequirementType -> [Mission]`

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::levels::LevelTable;
use crate::types::{ActionKey, Badge, KudosError, Level, Mission, RequirementType, Result};

/// One requirement counter an action feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRule {
    pub requirement_type: RequirementType,
    /// Count distinct entity ids instead of occurrences
    #[serde(default)]
    pub distinct: bool,
}

/// How a raw action maps to points and requirement counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRule {
    pub key: ActionKey,
    /// Points granted per occurrence
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub counters: Vec<CounterRule>,
}

/// Raw, unvalidated catalog as written in YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDefinition {
    pub levels: Vec<Level>,
    #[serde(default)]
    pub badges: Vec<Badge>,
    #[serde(default)]
    pub missions: Vec<Mission>,
    #[serde(default)]
    pub actions: Vec<ActionRule>,
}

/// Validated, indexed catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    levels: LevelTable,
    badges: Vec<Badge>,
    badge_index: HashMap<String, usize>,
    badges_by_requirement: HashMap<RequirementType, Vec<usize>>,
    missions: Vec<Mission>,
    mission_index: HashMap<String, usize>,
    missions_by_requirement: HashMap<RequirementType, Vec<usize>>,
    actions: HashMap<ActionKey, ActionRule>,
}

impl Catalog {
    /// Parse and validate a YAML catalog.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: CatalogDefinition = serde_yaml::from_str(yaml)?;
        Self::from_definition(definition)
    }

    /// Validate and index a catalog definition.
    pub fn from_definition(definition: CatalogDefinition) -> Result<Self> {
        let levels = LevelTable::new(definition.levels)?;

        // Actions
        let mut actions = HashMap::new();
        let mut counter_kinds: HashMap<RequirementType, bool> = HashMap::new();
        for rule in definition.actions {
            if rule.key.is_reserved() {
                return Err(KudosError::Configuration(format!(
                    "action key '{}' is reserved",
                    rule.key
                )));
            }
            if rule.points < 0 {
                return Err(KudosError::Configuration(format!(
                    "action '{}' grants negative points",
                    rule.key
                )));
            }
            for counter in &rule.counters {
                match counter_kinds.get(&counter.requirement_type) {
                    Some(&distinct) if distinct != counter.distinct => {
                        return Err(KudosError::Configuration(format!(
                            "requirement type '{}' is both distinct and non-distinct",
                            counter.requirement_type
                        )));
                    }
                    _ => {
                        counter_kinds.insert(counter.requirement_type.clone(), counter.distinct);
                    }
                }
            }
            let key = rule.key.clone();
            if actions.insert(key.clone(), rule).is_some() {
                return Err(KudosError::Configuration(format!(
                    "duplicate action key '{}'",
                    key
                )));
            }
        }
        let fed: HashSet<&RequirementType> = counter_kinds.keys().collect();

        // Badges
        let mut badge_index = HashMap::new();
        let mut badges_by_requirement: HashMap<RequirementType, Vec<usize>> = HashMap::new();
        for (idx, badge) in definition.badges.iter().enumerate() {
            if badge_index.insert(badge.key.clone(), idx).is_some() {
                return Err(KudosError::Configuration(format!(
                    "duplicate badge key '{}'",
                    badge.key
                )));
            }
            if badge.requirement_count == 0 {
                return Err(KudosError::Configuration(format!(
                    "badge '{}' has a zero requirement_count",
                    badge.key
                )));
            }
            if badge.points_reward < 0 {
                return Err(KudosError::Configuration(format!(
                    "badge '{}' has a negative points_reward",
                    badge.key
                )));
            }
            if !fed.contains(&badge.requirement_type) {
                return Err(KudosError::Configuration(format!(
                    "badge '{}' requires '{}' but no action feeds it",
                    badge.key, badge.requirement_type
                )));
            }
            badges_by_requirement
                .entry(badge.requirement_type.clone())
                .or_default()
                .push(idx);
        }

        // Missions
        let mut mission_index = HashMap::new();
        let mut missions_by_requirement: HashMap<RequirementType, Vec<usize>> = HashMap::new();
        for (idx, mission) in definition.missions.iter().enumerate() {
            if mission_index.insert(mission.id.clone(), idx).is_some() {
                return Err(KudosError::Configuration(format!(
                    "duplicate mission id '{}'",
                    mission.id
                )));
            }
            if mission.target_count == 0 {
                return Err(KudosError::Configuration(format!(
                    "mission '{}' has a zero target_count",
                    mission.id
                )));
            }
            if mission.points < 0 {
                return Err(KudosError::Configuration(format!(
                    "mission '{}' grants negative points",
                    mission.id
                )));
            }
            if !fed.contains(&mission.action_key) {
                return Err(KudosError::Configuration(format!(
                    "mission '{}' counts '{}' but no action feeds it",
                    mission.id, mission.action_key
                )));
            }
            missions_by_requirement
                .entry(mission.action_key.clone())
                .or_default()
                .push(idx);
        }

        Ok(Self {
            levels,
            badges: definition.badges,
            badge_index,
            badges_by_requirement,
            missions: definition.missions,
            mission_index,
            missions_by_requirement,
            actions,
        })
    }

    pub fn levels(&self) -> &LevelTable {
        &self.levels
    }

    pub fn badges(&self) -> &[Badge] {
        &self.badges
    }

    pub fn badge(&self, key: &str) -> Option<&Badge> {
        self.badge_index.get(key).map(|&idx| &self.badges[idx])
    }

    /// Badges whose requirement is `requirement`.
    pub fn badges_for<'a>(&'a self, requirement: &RequirementType) -> impl Iterator<Item = &'a Badge> + 'a {
        self.badges_by_requirement
            .get(requirement)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.badges[idx])
    }

    pub fn missions(&self) -> &[Mission] {
        &self.missions
    }

    pub fn mission(&self, id: &str) -> Option<&Mission> {
        self.mission_index.get(id).map(|&idx| &self.missions[idx])
    }

    /// Active missions counting `requirement`.
    pub fn missions_for<'a>(&'a self, requirement: &RequirementType) -> impl Iterator<Item = &'a Mission> + 'a {
        self.missions_by_requirement
            .get(requirement)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.missions[idx])
            .filter(|m| m.active)
    }

    pub fn action(&self, key: &ActionKey) -> Option<&ActionRule> {
        self.actions.get(key)
    }

    pub fn actions(&self) -> impl Iterator<Item = &ActionRule> {
        self.actions.values()
    }
}
