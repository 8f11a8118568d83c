//! Live combat statistics.
//!
//! One consumer thread writes through [`DamageAggregator::ingest`]; any number
//! of readers take snapshots, look at per-skill detail or reset. Every call
//! holds the same lock for its whole body, so a reader never sees half of an
//! ingested hit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, info};

use crate::catalog::SkillCatalog;
use crate::protocol::types::{
    AnalyzedSkill, CombatantStats, DamageEvent, DpsSnapshot, EntityId, JobClass, SkillCode,
};

/// Nicknames kept before names of entities outside the current window are forgotten.
pub const DEFAULT_NICKNAME_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombatPhase {
    /// Nothing recorded since the last reset.
    Idle,
    InCombat,
}

#[derive(Debug, Default)]
struct Accumulator {
    // Decided by the first skill seen, never changed afterwards
    job: Option<JobClass>,
    total_damage: u64,
    skills: IndexMap<SkillCode, AnalyzedSkill>,
}

#[derive(Debug, Default)]
struct CombatWindow {
    started: Option<(Instant, DateTime<Utc>)>,
    combatants: IndexMap<EntityId, Accumulator>,
    damage_taken: HashMap<EntityId, u64>,
}

#[derive(Debug, Default)]
struct MeterState {
    window: CombatWindow,
    // Identity, not an accumulator: survives resets
    nicknames: HashMap<EntityId, String>,
}

impl CombatWindow {
    fn involves(&self, id: EntityId) -> bool {
        self.combatants.contains_key(&id) || self.damage_taken.contains_key(&id)
    }
}

impl MeterState {
    fn display_name(&self, id: EntityId) -> String {
        self.nicknames.get(&id).cloned().unwrap_or_else(|| id.to_string())
    }
}

pub struct DamageAggregator {
    catalog: Arc<SkillCatalog>,
    state: Mutex<MeterState>,
    nickname_limit: usize,
}

impl DamageAggregator {
    pub fn new(catalog: Arc<SkillCatalog>) -> Self {
        Self::with_nickname_limit(catalog, DEFAULT_NICKNAME_LIMIT)
    }

    pub fn with_nickname_limit(catalog: Arc<SkillCatalog>, nickname_limit: usize) -> Self {
        Self { catalog, state: Mutex::new(MeterState::default()), nickname_limit }
    }

    // Every critical section leaves the state consistent, so a panic elsewhere
    // doesn't make it unusable.
    fn lock(&self) -> MutexGuard<'_, MeterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ingest(&self, event: &DamageEvent) {
        self.ingest_at(event, Instant::now());
    }

    pub fn ingest_at(&self, event: &DamageEvent, now: Instant) {
        let mut state = self.lock();
        let window = &mut state.window;

        if window.started.is_none() {
            window.started = Some((now, Utc::now()));
            debug!("[Aggregator] Combat started by {} (skill {})", event.attacker, event.skill);
        }

        let combatant = window.combatants.entry(event.attacker).or_insert_with(|| Accumulator {
            job: self.catalog.classify(event.skill),
            ..Default::default()
        });

        combatant
            .skills
            .entry(event.skill)
            .or_insert_with(|| AnalyzedSkill::new(event.skill, self.catalog.lookup_name(event.skill)))
            .record(event.amount, event.crit);
        combatant.total_damage = combatant.total_damage.saturating_add(event.amount);

        let taken = window.damage_taken.entry(event.target).or_default();
        *taken = taken.saturating_add(event.amount);
    }

    /// Names survive `reset`. Once `nickname_limit` names are held, adding a
    /// new one forgets every name not involved in the current combat window.
    pub fn set_nickname(&self, entity: EntityId, name: impl Into<String>) {
        let mut state = self.lock();
        let state = &mut *state;

        if state.nicknames.len() >= self.nickname_limit && !state.nicknames.contains_key(&entity) {
            let before = state.nicknames.len();
            let window = &state.window;
            state.nicknames.retain(|id, _| window.involves(*id));
            debug!("[Aggregator] Nickname limit reached, forgot {} names", before - state.nicknames.len());
        }
        state.nicknames.insert(entity, name.into());
    }

    pub fn clear_nicknames(&self) {
        let mut state = self.lock();
        let cleared = state.nicknames.len();
        state.nicknames.clear();
        info!("[Aggregator] Cleared {} nicknames", cleared);
    }

    pub fn phase(&self) -> CombatPhase {
        match self.lock().window.started {
            Some(_) => CombatPhase::InCombat,
            None => CombatPhase::Idle,
        }
    }

    pub fn snapshot(&self) -> DpsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> DpsSnapshot {
        let state = self.lock();
        let window = &state.window;

        let elapsed = window
            .started
            .map(|(start, _)| now.saturating_duration_since(start))
            .unwrap_or(Duration::ZERO);
        let secs = elapsed.as_secs_f64();

        let sum = window
            .combatants
            .values()
            .fold(0u64, |acc, c| acc.saturating_add(c.total_damage));

        let map = window
            .combatants
            .iter()
            .map(|(id, acc)| {
                let total = acc.total_damage;
                let stats = CombatantStats {
                    nickname: state.display_name(*id),
                    job: acc.job,
                    total_damage: total,
                    dps: if secs > 0.0 { total as f64 / secs } else { 0.0 },
                    damage_contribution: if sum > 0 { total as f64 / sum as f64 * 100.0 } else { 0.0 },
                    analyzed_data: acc.skills.clone(),
                };
                (*id, stats)
            })
            .collect();

        // The combat window is named after whoever soaked the most damage
        let target_name = window
            .damage_taken
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, _)| state.display_name(*id))
            .unwrap_or_default();

        DpsSnapshot {
            target_name,
            combat_started_at: window.started.map(|(_, wall)| wall),
            elapsed_ms: elapsed.as_millis() as u64,
            map,
        }
    }

    /// Per-skill breakdown for one combatant; empty if it isn't known.
    pub fn detail(&self, entity: EntityId) -> IndexMap<SkillCode, AnalyzedSkill> {
        self.lock()
            .window
            .combatants
            .get(&entity)
            .map(|c| c.skills.clone())
            .unwrap_or_default()
    }

    /// Clears every accumulator and the combat start in one step.
    pub fn reset(&self) {
        let mut state = self.lock();
        let dropped = state.window.combatants.len();
        state.window = CombatWindow::default();
        info!("[Aggregator] Reset ({} combatants cleared)", dropped);
    }
}
