use anyhow::Result;
use approx::assert_relative_eq;
use changegraph_core::{
    ChangeEvent, ChangeGraphError, ChangeType, ConflictType, Criticality, DependencyKind,
    EngineConfig, GraphStore, ReleaseStatus, ReleaseStrategy, RiskLevel, RollbackComplexity,
};
use changegraph_engine::{ChangeSelector, CommandResponse, Engine};
use changegraph_graph::MemoryGraphStore;
use chrono::{Duration, Utc};
use std::sync::Arc;

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config
        .catalog
        .criticality_overrides
        .insert("tags/TagA.json".into(), Criticality::Critical);
    config
}

fn modified(path: &str, hash: &str, branch: &str, offset_secs: i64) -> ChangeEvent {
    ChangeEvent::new(path, ChangeType::Modified, "dev", branch)
        .with_hash(hash)
        .at(Utc::now() + Duration::seconds(offset_secs))
}

/// TagA (Critical) <- ViewB (Medium, depends on TagA).
async fn scenario(store: Arc<MemoryGraphStore>) -> Result<Engine> {
    let engine = Engine::open(store, config()).await?;
    let tag = engine.register_resource("tags/TagA.json", None).await?;
    let view = engine.register_resource("views/ViewB.json", None).await?;
    assert_eq!(tag.criticality, Criticality::Critical);
    assert_eq!(view.criticality, Criticality::Medium);
    engine.add_edge(&view.key, &tag.key, DependencyKind::Binds).await?;
    Ok(engine)
}

#[tokio::test]
async fn test_end_to_end_scenario() -> Result<()> {
    let engine = scenario(Arc::new(MemoryGraphStore::new())).await?;

    let change1 = engine.observe(&modified("tags/TagA.json", "t1", "main", 0)).await?;
    let change2 = engine.observe(&modified("views/ViewB.json", "v1", "main", 1)).await?;
    assert_relative_eq!(change1.risk_score, 0.55, epsilon = 1e-9);
    assert_eq!(change1.risk_level, RiskLevel::High);
    assert_relative_eq!(change2.risk_score, 0.30, epsilon = 1e-9);
    assert_eq!(change2.risk_level, RiskLevel::Medium);

    let impact = engine.analyze_impact(&ChangeSelector::Ids(vec![change1.id]), None)?;
    let reached: Vec<(String, usize)> = impact
        .affected_resources
        .iter()
        .map(|a| (a.key.to_string(), a.depth))
        .collect();
    assert_eq!(
        reached,
        vec![
            ("tag:tags/TagA.json".to_string(), 0),
            ("view:views/ViewB.json".to_string(), 1)
        ]
    );
    assert_eq!(impact.rollback_complexity, RollbackComplexity::High);
    assert_relative_eq!(impact.impact_score, 0.55 + 0.55 / 2.0, epsilon = 1e-9);
    assert!(!impact.partial);

    // Submitted in the "wrong" order on purpose.
    let plan = engine.plan_release(
        &ChangeSelector::Ids(vec![change2.id, change1.id]),
        Some(ReleaseStrategy::Incremental),
        None,
        Some("main".into()),
    )?;
    assert_eq!(plan.changes_included, vec![change1.id, change2.id]);
    assert_eq!(plan.status, ReleaseStatus::Draft);
    assert_eq!(plan.rollback_plan[0].change_id, change2.id);
    Ok(())
}

#[tokio::test]
async fn test_impact_union_contains_single_seed_reports() -> Result<()> {
    let engine = scenario(Arc::new(MemoryGraphStore::new())).await?;
    let c1 = engine.observe(&modified("tags/TagA.json", "t1", "main", 0)).await?;
    let c2 = engine.observe(&modified("views/ViewB.json", "v1", "main", 1)).await?;

    let union = engine.analyze_impact(&ChangeSelector::Ids(vec![c1.id, c2.id]), None)?;
    for id in [c1.id, c2.id] {
        let single = engine.analyze_impact(&ChangeSelector::Ids(vec![id]), None)?;
        assert!(single.affected_keys().is_subset(&union.affected_keys()));
    }
    assert_eq!(union.depth_of(&c2.resource_key), Some(0));
    Ok(())
}

#[tokio::test]
async fn test_branch_conflicts_and_approval_gate() -> Result<()> {
    let engine = scenario(Arc::new(MemoryGraphStore::new())).await?;
    let a_view = engine.observe(&modified("views/ViewB.json", "va", "feature-a", 0)).await?;
    let b_view = engine.observe(&modified("views/ViewB.json", "vb", "feature-b", 1)).await?;
    let b_tag = engine.observe(&modified("tags/TagA.json", "tb", "feature-b", 2)).await?;

    let left = ChangeSelector::Branch("feature-a".into());
    let right = ChangeSelector::Branch("feature-b".into());
    let ab = engine.predict_conflicts(&left, &right)?;
    let ba = engine.predict_conflicts(&right, &left)?;

    for report in [&ab, &ba] {
        assert_eq!(report.of_type(ConflictType::FileLevel).count(), 1);
        let dep: Vec<_> = report.of_type(ConflictType::Dependency).collect();
        assert_eq!(dep.len(), 1);
        assert_eq!(dep[0].hop_distance, Some(1));
    }
    let file_level = ab
        .of_type(ConflictType::FileLevel)
        .next()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing file-level conflict"))?;
    assert!(file_level.involves_change(&a_view.id));
    assert!(file_level.involves_change(&b_view.id));

    // ViewB's dependency on the Critical tag makes that prediction Critical.
    let critical: Vec<_> = ab.critical().map(|p| p.id).collect();
    assert!(!critical.is_empty());

    let plan = engine.plan_release(
        &ChangeSelector::Branch("feature-b".into()),
        None,
        None,
        Some("feature-b".into()),
    )?;
    assert_eq!(plan.position_of(&b_tag.id), Some(0));

    engine.transition_release(&plan.id, ReleaseStatus::UnderReview)?;
    let blocked = engine.transition_release(&plan.id, ReleaseStatus::Approved);
    assert!(matches!(blocked, Err(ChangeGraphError::ApprovalBlocked { .. })));

    let blocking: Vec<_> = match blocked {
        Err(ChangeGraphError::ApprovalBlocked { conflicts }) => conflicts,
        _ => unreachable!(),
    };
    for id in blocking {
        engine.resolve_conflict(&plan.id, id)?;
    }
    let approved = engine.transition_release(&plan.id, ReleaseStatus::Approved)?;
    assert_eq!(approved.status, ReleaseStatus::Approved);

    let invalid = engine.transition_release(&plan.id, ReleaseStatus::Completed);
    assert!(matches!(invalid, Err(ChangeGraphError::InvalidTransition { .. })));
    Ok(())
}

#[tokio::test]
async fn test_hydration_restores_state() -> Result<()> {
    let store = Arc::new(MemoryGraphStore::new());
    let change = {
        let engine = scenario(store.clone()).await?;
        engine.observe(&modified("tags/TagA.json", "t1", "main", 0)).await?
    };

    let reopened = Engine::open(store.clone(), config()).await?;
    assert_eq!(reopened.catalog().len(), 2);
    assert_eq!(reopened.snapshot().edge_count(), 1);
    assert!(reopened.change(&change.id).is_some());

    let history = reopened.history(&change.resource_key).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(store.get_history(&change.resource_key).await?.len(), 1);

    // Fingerprints continue from the persisted state.
    let next = reopened.observe(&modified("tags/TagA.json", "t2", "main", 5)).await?;
    assert_eq!(next.before_fingerprint, change.after_fingerprint);
    Ok(())
}

#[tokio::test]
async fn test_store_outage_fails_mutations_fast() -> Result<()> {
    let store = Arc::new(MemoryGraphStore::new());
    let engine = scenario(store.clone()).await?;
    let change = engine.observe(&modified("tags/TagA.json", "t1", "main", 0)).await?;

    store.set_available(false);
    let err = engine.register_resource("views/Other.json", None).await.unwrap_err();
    assert!(matches!(err, ChangeGraphError::StoreUnavailable(_)));
    assert!(engine.catalog().lookup("views/Other.json").is_err());

    let impact = engine.analyze_impact(&ChangeSelector::Ids(vec![change.id]), None)?;
    assert_eq!(impact.affected_resources.len(), 2);

    // Nothing to hydrate from.
    assert!(Engine::open(store, config()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_observations_on_distinct_resources() -> Result<()> {
    let engine = Arc::new(scenario(Arc::new(MemoryGraphStore::new())).await?);
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let path = format!("views/Screen{}.json", i);
            engine.observe(&modified(&path, "h1", "main", i)).await
        }));
    }
    for handle in handles {
        handle.await??;
    }
    assert_eq!(engine.catalog().len(), 18);
    Ok(())
}

#[tokio::test]
async fn test_json_command_surface() -> Result<()> {
    let engine = scenario(Arc::new(MemoryGraphStore::new())).await?;
    engine.observe(&modified("tags/TagA.json", "t1", "main", 0)).await?;

    let out = engine.execute_json(r#"{"command": "analyze-impact", "changes": {"branch": "main"}}"#)?;
    let response: CommandResponse = serde_json::from_str(&out)?;
    match response {
        CommandResponse::Impact(report) => assert_eq!(report.affected_resources.len(), 2),
        other => anyhow::bail!("unexpected response {:?}", other),
    }

    let err = engine
        .execute_json(r#"{"command": "plan-release", "changes": {"ids": []}}"#)
        .unwrap_err();
    assert!(matches!(err, ChangeGraphError::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn test_engine_from_config_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("changegraph.toml");
    std::fs::write(
        &path,
        r#"
[catalog.criticality_overrides]
"tags/**" = "critical"

[release]
default_strategy = "canary"

[store]
backend = "memory"
"#,
    )?;

    let config = changegraph_core::ConfigManager::load_from(&path)?.into_config();
    let engine = Engine::builder(config).build().await?;
    let tag = engine.register_resource("tags/Line1/Speed.json", None).await?;
    assert_eq!(tag.criticality, Criticality::Critical);

    let change = engine.observe(&modified("tags/Line1/Speed.json", "s1", "main", 0)).await?;
    let plan = engine.plan_release(&ChangeSelector::Ids(vec![change.id]), None, None, None)?;
    assert_eq!(plan.strategy, ReleaseStrategy::Canary);
    assert!(plan.aggregate_risk < change.risk_score);
    Ok(())
}

#[cfg(feature = "rocksdb")]
#[tokio::test]
async fn test_rocksdb_backed_engine_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = config();
    config.store.backend = "rocksdb".to_string();
    config.store.path = dir.path().join("db");

    let change = {
        let engine = Engine::builder(config.clone()).build().await?;
        let tag = engine.register_resource("tags/TagA.json", None).await?;
        let view = engine.register_resource("views/ViewB.json", None).await?;
        engine.add_edge(&view.key, &tag.key, DependencyKind::Binds).await?;
        engine.observe(&modified("tags/TagA.json", "t1", "main", 0)).await?
    };

    let reopened = Engine::builder(config).build().await?;
    assert_eq!(reopened.snapshot().edge_count(), 1);
    let impact = reopened.analyze_impact(&ChangeSelector::Ids(vec![change.id]), None)?;
    assert_eq!(impact.affected_resources.len(), 2);
    Ok(())
}
