//! Durable pipeline state (`state.json`).

use std::path::{Path, PathBuf};

use skillfactory_shared::{
    CHECKPOINT_SCHEMA_VERSION, PhaseId, PhaseResult, PhaseStatus, PipelineState, Result,
    SkillFactoryError,
};
use tracing::{debug, warn};
use uuid::Uuid;

pub const STATE_FILE: &str = "state.json";

/// Metric set by the phase that asks the sequencer to pause.
pub const METRIC_IS_PAUSED: &str = "is_paused";
/// Count of conflicts still waiting for a human decision.
pub const METRIC_CONFLICTS_UNRESOLVED: &str = "conflicts_unresolved";
pub const METRIC_EVIDENCE_RATE: &str = "evidence_rate";

pub fn state_path(output_dir: &Path) -> PathBuf {
    output_dir.join(STATE_FILE)
}

/// Persist the state. Written to a unique temp file first, then renamed over
/// `state.json`, so readers never see a partial checkpoint.
pub fn save(state: &PipelineState, output_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir).map_err(|e| SkillFactoryError::io(output_dir, e))?;
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| SkillFactoryError::parse(format!("failed to serialize state: {e}")))?;

    let target = state_path(output_dir);
    let temp = output_dir.join(format!("{STATE_FILE}.{}.tmp", Uuid::now_v7()));
    std::fs::write(&temp, json).map_err(|e| SkillFactoryError::io(&temp, e))?;
    if let Err(e) = std::fs::rename(&temp, &target) {
        let _ = std::fs::remove_file(&temp);
        return Err(SkillFactoryError::io(&target, e));
    }
    debug!(path = %target.display(), "checkpoint saved");
    Ok(target)
}

/// Load the state, or `None` when there is no usable checkpoint.
pub fn load(output_dir: &Path) -> Option<PipelineState> {
    let path = state_path(output_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable checkpoint, starting fresh");
            return None;
        }
    };
    let state: PipelineState = match serde_json::from_str(&content) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid checkpoint, starting fresh");
            return None;
        }
    };
    if state.schema_version > CHECKPOINT_SCHEMA_VERSION {
        warn!(
            found = state.schema_version,
            supported = CHECKPOINT_SCHEMA_VERSION,
            "checkpoint written by a newer version, starting fresh"
        );
        return None;
    }
    Some(state)
}

/// True only when the phase last finished `done`.
pub fn should_skip(state: &PipelineState, phase: PhaseId) -> bool {
    state
        .result(phase)
        .is_some_and(|r| r.status == PhaseStatus::Done)
}

/// Merge a phase result into the state: replaces the previous result for that
/// phase, rolls up totals and derives the pause flag from the metrics.
pub fn record_result(state: &mut PipelineState, result: PhaseResult) {
    state.current_phase = Some(result.phase);
    state.total_cost_usd += result.api_cost_usd;
    state.total_tokens += result.tokens_used;

    let unresolved = result
        .metrics
        .get(METRIC_CONFLICTS_UNRESOLVED)
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    if result.metric_bool(METRIC_IS_PAUSED) && unresolved > 0 {
        state.is_paused = true;
        state.pause_reason = Some(format!("{unresolved} unresolved conflicts"));
    } else {
        state.is_paused = false;
        state.pause_reason = None;
    }

    state.phases.insert(result.phase, result);
    state.updated_at = chrono::Utc::now();
}

/// Lift the pause after resolutions were applied.
pub fn clear_pause(state: &mut PipelineState) {
    state.is_paused = false;
    state.pause_reason = None;
    state.updated_at = chrono::Utc::now();
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use skillfactory_shared::BuildId;

    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sf-checkpoint-{}", Uuid::now_v7()))
    }

    fn result(phase: PhaseId, status: PhaseStatus) -> PhaseResult {
        let now = Utc::now();
        PhaseResult {
            phase,
            status,
            started_at: now,
            finished_at: now,
            score: 75.0,
            item_count: 4,
            api_cost_usd: 0.5,
            tokens_used: 1000,
            artifacts: vec!["atoms_raw.json".into()],
            metrics: BTreeMap::new(),
            error: None,
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = temp_dir();
        let mut state = PipelineState::new(BuildId::new());
        record_result(&mut state, result(PhaseId::Baseline, PhaseStatus::Done));
        record_result(&mut state, result(PhaseId::Audit, PhaseStatus::Failed));

        save(&state, &dir).unwrap();
        let loaded = load(&dir).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.total_tokens, 2000);
        assert_eq!(loaded.current_phase, Some(PhaseId::Audit));

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STATE_FILE.to_string()]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_or_invalid_checkpoint_is_absent() {
        let dir = temp_dir();
        assert!(load(&dir).is_none());

        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(state_path(&dir), "{ not json").unwrap();
        assert!(load(&dir).is_none());

        std::fs::write(state_path(&dir), r#"{"phases": 42}"#).unwrap();
        assert!(load(&dir).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tolerates_unknown_and_missing_fields() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            state_path(&dir),
            r#"{"build_id": "build_x", "future_field": true}"#,
        )
        .unwrap();
        let state = load(&dir).unwrap();
        assert_eq!(state.build_id.as_str(), "build_x");
        assert!(state.phases.is_empty());
        assert!(!state.is_paused);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            state_path(&dir),
            r#"{"schema_version": 99, "build_id": "build_x"}"#,
        )
        .unwrap();
        assert!(load(&dir).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn only_done_phases_are_skipped() {
        let mut state = PipelineState::new(BuildId::new());
        record_result(&mut state, result(PhaseId::Baseline, PhaseStatus::Done));
        record_result(&mut state, result(PhaseId::Audit, PhaseStatus::Failed));
        record_result(&mut state, result(PhaseId::Extract, PhaseStatus::Skipped));

        assert!(should_skip(&state, PhaseId::Baseline));
        assert!(!should_skip(&state, PhaseId::Audit));
        assert!(!should_skip(&state, PhaseId::Extract));
        assert!(!should_skip(&state, PhaseId::Dedup));
    }

    #[test]
    fn pause_requires_unresolved_conflicts() {
        let mut state = PipelineState::new(BuildId::new());
        let mut dedup = result(PhaseId::Dedup, PhaseStatus::Done);
        dedup.metrics.insert(METRIC_IS_PAUSED.into(), true.into());
        dedup
            .metrics
            .insert(METRIC_CONFLICTS_UNRESOLVED.into(), 2.into());
        record_result(&mut state, dedup.clone());
        assert!(state.is_paused);
        assert_eq!(state.pause_reason.as_deref(), Some("2 unresolved conflicts"));

        dedup
            .metrics
            .insert(METRIC_CONFLICTS_UNRESOLVED.into(), 0.into());
        record_result(&mut state, dedup);
        assert!(!state.is_paused);
        assert!(state.pause_reason.is_none());
    }
}
