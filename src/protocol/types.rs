use std::net::SocketAddr;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub type EntityId = u64;
pub type SkillCode = u32;

/// Identifies one direction of one TCP connection (source -> destination).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

/// A captured TCP payload on its way from the sniffer thread to the decoder.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub seq: u64,
    pub stream: StreamKey,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageEvent {
    pub attacker: EntityId,
    pub target: EntityId,
    pub skill: SkillCode,
    pub amount: u64,
    pub crit: bool,
}

/// Everything the decoder can pull out of a framed game message.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Damage(DamageEvent),
    Nickname { entity: EntityId, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobClass {
    Gladiator,
    Templar,
    Ranger,
    Assassin,
    Sorcerer,
    Cleric,
    Elementalist,
    Chanter,
}

// Ranges never overlap, so lookup order does not matter.
const JOB_RANGES: [(RangeInclusive<SkillCode>, JobClass); 8] = [
    (11_000_000..=11_999_999, JobClass::Gladiator),
    (12_000_000..=12_999_999, JobClass::Templar),
    (13_000_000..=13_999_999, JobClass::Assassin),
    (14_000_000..=14_999_999, JobClass::Ranger),
    (15_000_000..=15_999_999, JobClass::Sorcerer),
    (16_000_000..=16_999_999, JobClass::Elementalist),
    (17_000_000..=17_999_999, JobClass::Cleric),
    (18_000_000..=18_999_999, JobClass::Chanter),
];

impl JobClass {
    pub const ALL: [JobClass; 8] = [
        JobClass::Gladiator,
        JobClass::Templar,
        JobClass::Ranger,
        JobClass::Assassin,
        JobClass::Sorcerer,
        JobClass::Cleric,
        JobClass::Elementalist,
        JobClass::Chanter,
    ];

    /// Classifies a skill code by its numeric range. `None` outside every range.
    pub fn from_skill_code(skill: SkillCode) -> Option<JobClass> {
        JOB_RANGES
            .iter()
            .find(|(range, _)| range.contains(&skill))
            .map(|(_, job)| *job)
    }

    /// In-game (Korean) class name.
    pub fn display_name(self) -> &'static str {
        match self {
            JobClass::Gladiator => "검성",
            JobClass::Templar => "수호성",
            JobClass::Ranger => "궁성",
            JobClass::Assassin => "살성",
            JobClass::Sorcerer => "마도성",
            JobClass::Cleric => "치유성",
            JobClass::Elementalist => "정령성",
            JobClass::Chanter => "호법성",
        }
    }

    pub fn basic_skill_code(self) -> SkillCode {
        match self {
            JobClass::Gladiator => 11_020_000,
            JobClass::Templar => 12_010_000,
            JobClass::Ranger => 14_020_000,
            JobClass::Assassin => 13_010_000,
            JobClass::Sorcerer => 15_210_000,
            JobClass::Cleric => 17_010_000,
            JobClass::Elementalist => 16_010_000,
            JobClass::Chanter => 18_010_000,
        }
    }
}

/// Per (entity, skill) accumulator.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedSkill {
    #[serde(skip)]
    pub skill_code: SkillCode,
    pub damage_amount: u64,
    pub crit_times: u32,
    // The overlay reads the hit count as `times`.
    #[serde(rename = "times")]
    pub times_hit: u32,
    pub skill_name: String,
}

impl AnalyzedSkill {
    pub fn new(skill_code: SkillCode, skill_name: impl Into<String>) -> Self {
        Self { skill_code, skill_name: skill_name.into(), ..Default::default() }
    }

    pub fn record(&mut self, amount: u64, crit: bool) {
        self.damage_amount = self.damage_amount.saturating_add(amount);
        self.times_hit = self.times_hit.saturating_add(1);
        if crit {
            self.crit_times = self.crit_times.saturating_add(1);
        }
    }

    /// Whole-percent crit rate, rounded down.
    pub fn crit_rate(&self) -> u32 {
        if self.times_hit == 0 {
            return 0;
        }
        (u64::from(self.crit_times) * 100 / u64::from(self.times_hit)) as u32
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CombatantStats {
    pub nickname: String,
    pub job: Option<JobClass>,
    pub total_damage: u64,
    pub dps: f64,
    pub damage_contribution: f64,
    pub analyzed_data: IndexMap<SkillCode, AnalyzedSkill>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DpsSnapshot {
    pub target_name: String,
    pub combat_started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub map: IndexMap<EntityId, CombatantStats>,
}

impl DpsSnapshot {
    /// Entity ids ordered by damage contribution, highest first.
    pub fn ranking(&self) -> Vec<(EntityId, &CombatantStats)> {
        let mut rows: Vec<_> = self.map.iter().map(|(id, stats)| (*id, stats)).collect();
        rows.sort_by(|a, b| b.1.damage_contribution.total_cmp(&a.1.damage_contribution));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_range_boundaries() {
        let expected = [
            (11_000_000, JobClass::Gladiator),
            (12_000_000, JobClass::Templar),
            (13_000_000, JobClass::Assassin),
            (14_000_000, JobClass::Ranger),
            (15_000_000, JobClass::Sorcerer),
            (16_000_000, JobClass::Elementalist),
            (17_000_000, JobClass::Cleric),
            (18_000_000, JobClass::Chanter),
        ];

        for (low, job) in expected {
            let high = low + 999_999;
            assert_eq!(JobClass::from_skill_code(low), Some(job), "low edge of {:?}", job);
            assert_eq!(JobClass::from_skill_code(high), Some(job), "high edge of {:?}", job);
            assert_eq!(JobClass::from_skill_code(low + 20_001), Some(job));
        }
    }

    #[test]
    fn classify_neighbours_of_every_range() {
        assert_eq!(JobClass::from_skill_code(10_999_999), None);
        assert_eq!(JobClass::from_skill_code(11_999_999), Some(JobClass::Gladiator));
        assert_eq!(JobClass::from_skill_code(12_000_000), Some(JobClass::Templar));
        assert_eq!(JobClass::from_skill_code(12_999_999), Some(JobClass::Templar));
        assert_eq!(JobClass::from_skill_code(13_000_000), Some(JobClass::Assassin));
        assert_eq!(JobClass::from_skill_code(13_999_999), Some(JobClass::Assassin));
        assert_eq!(JobClass::from_skill_code(14_000_000), Some(JobClass::Ranger));
        assert_eq!(JobClass::from_skill_code(14_999_999), Some(JobClass::Ranger));
        assert_eq!(JobClass::from_skill_code(15_000_000), Some(JobClass::Sorcerer));
        assert_eq!(JobClass::from_skill_code(15_999_999), Some(JobClass::Sorcerer));
        assert_eq!(JobClass::from_skill_code(16_000_000), Some(JobClass::Elementalist));
        assert_eq!(JobClass::from_skill_code(16_999_999), Some(JobClass::Elementalist));
        assert_eq!(JobClass::from_skill_code(17_000_000), Some(JobClass::Cleric));
        assert_eq!(JobClass::from_skill_code(17_999_999), Some(JobClass::Cleric));
        assert_eq!(JobClass::from_skill_code(18_000_000), Some(JobClass::Chanter));
        assert_eq!(JobClass::from_skill_code(18_999_999), Some(JobClass::Chanter));
        assert_eq!(JobClass::from_skill_code(19_000_000), None);
        assert_eq!(JobClass::from_skill_code(0), None);
        assert_eq!(JobClass::from_skill_code(SkillCode::MAX), None);
    }

    #[test]
    fn basic_skill_belongs_to_its_own_class() {
        for job in JobClass::ALL {
            assert_eq!(JobClass::from_skill_code(job.basic_skill_code()), Some(job));
        }
    }

    #[test]
    fn analyzed_skill_serializes_for_overlay() {
        let mut skill = AnalyzedSkill::new(11_020_001, "Slash");
        skill.record(500, false);
        skill.record(1200, true);

        let json = serde_json::to_value(&skill).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "damageAmount": 1700, "critTimes": 1, "times": 2, "skillName": "Slash" })
        );
        assert_eq!(skill.crit_rate(), 50);
    }

    #[test]
    fn job_serializes_as_upper_case_name() {
        let json = serde_json::to_string(&Some(JobClass::Elementalist)).unwrap();
        assert_eq!(json, "\"ELEMENTALIST\"");
    }
}
