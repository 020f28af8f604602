//! End-to-end scenarios against the `SkillManager` façade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use skillbank::embed::{Embedder, EmbedderFactory, HashingEmbedder};
use skillbank::{Error, NewSkill, SkillManager, SkillType, SkillbankConfig};
use tempfile::TempDir;

const DIM: usize = 64;

fn hashing_factory() -> EmbedderFactory {
    Box::new(|| Ok(Box::new(HashingEmbedder::new(DIM)) as Box<dyn Embedder>))
}

fn bank() -> (TempDir, SkillManager) {
    let dir = TempDir::new().unwrap();
    let mut config = SkillbankConfig::new(dir.path());
    config.embedding_dim = DIM;
    let mgr = SkillManager::open_with_embedder(config, hashing_factory()).unwrap();
    (dir, mgr)
}

// ── Scenario: create, search, delete ─────────────────────────

#[test]
fn create_search_delete() {
    let (_dir, mgr) = bank();
    mgr.add_skill(
        NewSkill::new("parse_json", "# Parse JSON\n\nSteps…", SkillType::Basic)
            .with_tags(["json"]),
    )
    .unwrap();

    let hits = mgr.search_skills("json validation", 3).unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].skill_name, "parse_json");
    assert!(hits[0].score > 0.0 && hits[0].score <= 1.0);

    assert!(mgr.delete_skill("parse_json").unwrap());
    assert!(mgr.search_skills("json", 3).unwrap().is_empty());
}

#[test]
fn delete_missing_skill_is_noop_false() {
    let (_dir, mgr) = bank();
    assert!(!mgr.delete_skill("never_existed").unwrap());
}

#[test]
fn search_with_k_zero_is_empty() {
    let (_dir, mgr) = bank();
    mgr.add_skill(NewSkill::new("s", "body", SkillType::Basic)).unwrap();
    assert!(mgr.search_skills("body", 0).unwrap().is_empty());
}

#[test]
fn empty_bank_operations_return_empty() {
    let (_dir, mgr) = bank();
    assert!(mgr.list_skills(None, &[]).unwrap().is_empty());
    assert!(mgr.search_skills("anything", 5).unwrap().is_empty());
    assert!(mgr.compose_for_task("anything", 5).unwrap().is_empty());
}

// ── Scenario: versioning ─────────────────────────────────────

#[test]
fn versioning_keeps_full_history() {
    let (_dir, mgr) = bank();
    mgr.add_skill(NewSkill::new("s", "v1", SkillType::Basic)).unwrap();

    let version = mgr.update_skill("s", "v2", Some("fix")).unwrap();
    assert_eq!(version, 2);
    assert_eq!(mgr.get_skill("s").unwrap().version, 2);

    let versions = mgr.get_versions("s").unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].content, "v1");
    assert_eq!(versions[1].content, "v2");
}

#[test]
fn update_missing_skill_fails_cleanly() {
    let (_dir, mgr) = bank();
    assert!(matches!(
        mgr.update_skill("ghost", "x", None),
        Err(Error::UnknownSkill(_))
    ));
    assert!(mgr.list_skills(None, &[]).unwrap().is_empty());
}

// ── Scenario: dependency composition ─────────────────────────

#[test]
fn compose_orders_dependency_chain() {
    let (_dir, mgr) = bank();
    mgr.add_skill(NewSkill::new("a", "prepare the ground", SkillType::Basic)).unwrap();
    mgr.add_skill(
        NewSkill::new("b", "assemble the parts", SkillType::Basic).with_dependencies(["a"]),
    )
    .unwrap();
    mgr.add_skill(
        NewSkill::new("c", "run c to completion", SkillType::Composite)
            .with_dependencies(["b"]),
    )
    .unwrap();

    let plan = mgr.compose_for_task("run c", 5).unwrap();
    assert_eq!(plan.names(), vec!["a", "b", "c"]);

    let validation = mgr.validate_composition(&plan);
    assert!(validation.valid, "issues: {:?}", validation.issues);
    assert_eq!(validation.skill_count, 3);
}

// ── Scenario: coverage recommendation ────────────────────────

#[test]
fn coverage_on_empty_bank_recommends_adding_skills() {
    let (_dir, mgr) = bank();
    let report = mgr.analyze_coverage("deploy app").unwrap();
    assert_eq!(report.overall_coverage, 0.0);
    assert!(report.recommendation.contains("Insufficient"));
}

// ── Scenario: execution stats ────────────────────────────────

#[test]
fn execution_stats_accumulate() {
    let (_dir, mgr) = bank();
    mgr.add_skill(NewSkill::new("x", "body", SkillType::Basic)).unwrap();

    mgr.record_execution("x", true, Some(10.0), None).unwrap();
    mgr.record_execution("x", false, Some(20.0), None).unwrap();
    mgr.record_execution("x", true, Some(30.0), None).unwrap();
    mgr.record_execution("x", true, Some(40.0), None).unwrap();

    let stats = mgr.get_skill_stats("x").unwrap();
    assert_eq!(stats.usage_count, 4);
    assert_eq!(stats.success_count, 3);
    assert!((stats.success_rate - 0.75).abs() < 1e-9);

    let mut expected = 10.0;
    for sample in [20.0, 30.0, 40.0] {
        expected = 0.2 * sample + 0.8 * expected;
    }
    assert!((stats.avg_execution_ms.unwrap() - expected).abs() < 1e-9);

    let history = mgr.get_history("x", None).unwrap();
    assert_eq!(history.len(), 4);
    assert!(history[0].success);
    assert_eq!(history[1].execution_time_ms, Some(20.0));
}

#[test]
fn history_respects_limit_and_context() {
    let (_dir, mgr) = bank();
    mgr.add_skill(NewSkill::new("x", "body", SkillType::Basic)).unwrap();
    for i in 0..5 {
        let context = serde_json::json!({ "attempt": i });
        mgr.record_execution("x", true, None, Some(context)).unwrap();
    }

    let tail = mgr.get_history("x", Some(2)).unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[1].context.as_ref().unwrap()["attempt"], 4);
}

#[test]
fn history_of_unknown_skill_errors() {
    let (_dir, mgr) = bank();
    assert!(matches!(
        mgr.get_history("ghost", None),
        Err(Error::UnknownSkill(_))
    ));
}

// ── Scenario: auto-sync degraded mode ────────────────────────

#[test]
fn degraded_backend_recovers_after_rebuild() {
    let dir = TempDir::new().unwrap();
    let mut config = SkillbankConfig::new(dir.path());
    config.embedding_dim = DIM;

    let available = Arc::new(AtomicBool::new(false));
    let flag = available.clone();
    let factory: EmbedderFactory = Box::new(move || {
        if flag.load(Ordering::SeqCst) {
            Ok(Box::new(HashingEmbedder::new(DIM)) as Box<dyn Embedder>)
        } else {
            Err(Error::VectorUnavailable("backend offline".into()))
        }
    });
    let mgr = SkillManager::open_with_embedder(config, factory).unwrap();

    // Write path succeeds even though the vector sync cannot.
    mgr.add_skill(NewSkill::new("parse_json", "parse json files", SkillType::Basic))
        .unwrap();
    assert_eq!(mgr.get_skill("parse_json").unwrap().name, "parse_json");
    assert!(mgr.search_skills("parse json", 3).unwrap().is_empty());

    // Backend comes up; the rebuild makes the skill discoverable.
    available.store(true, Ordering::SeqCst);
    assert_eq!(mgr.rebuild_index().unwrap(), 1);
    let hits = mgr.search_skills("parse json", 3).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].skill_name, "parse_json");
}

// ── Export / import ──────────────────────────────────────────

#[test]
fn export_import_roundtrip() {
    let (dir, mgr) = bank();
    mgr.add_skill(
        NewSkill::new("exported", "# Exported\n\nBody text.\n", SkillType::Composite)
            .with_description("a roundtrip test")
            .with_tags(["alpha", "beta"]),
    )
    .unwrap();

    let path = dir.path().join("exported.md");
    mgr.export_skill("exported", &path).unwrap();
    assert!(mgr.delete_skill("exported").unwrap());

    mgr.import_skill_from_file(&path).unwrap();
    let skill = mgr.get_skill("exported").unwrap();
    assert_eq!(skill.content, "# Exported\n\nBody text.\n");
    assert_eq!(skill.skill_type, SkillType::Composite);
    assert_eq!(skill.description, "a roundtrip test");
    let mut tags = skill.tags.clone();
    tags.sort();
    assert_eq!(tags, vec!["alpha", "beta"]);
}

#[test]
fn import_preserves_unknown_front_matter_keys() {
    let (dir, mgr) = bank();
    let source = dir.path().join("annotated.md");
    std::fs::write(
        &source,
        "---\nname: annotated\nskill_type: basic\ndescription: has extras\nauthor: someone\npriority: 3\n---\nbody\n",
    )
    .unwrap();

    mgr.import_skill_from_file(&source).unwrap();

    let out = dir.path().join("re-exported.md");
    mgr.export_skill("annotated", &out).unwrap();
    let exported = std::fs::read_to_string(&out).unwrap();
    assert!(exported.contains("author: someone"));
    assert!(exported.contains("priority: 3"));
}

#[test]
fn import_without_front_matter_uses_file_stem() {
    let (dir, mgr) = bank();
    let source = dir.path().join("bare_notes.md");
    std::fs::write(&source, "# Just a body\n").unwrap();

    mgr.import_skill_from_file(&source).unwrap();
    let skill = mgr.get_skill("bare_notes").unwrap();
    assert_eq!(skill.skill_type, SkillType::Basic);
    assert_eq!(skill.content, "# Just a body\n");
    assert_eq!(skill.description, "");
}

#[test]
fn import_colliding_name_fails_with_duplicate() {
    let (dir, mgr) = bank();
    mgr.add_skill(NewSkill::new("taken", "original", SkillType::Basic)).unwrap();

    let source = dir.path().join("taken.md");
    std::fs::write(&source, "# Would collide\n").unwrap();
    assert!(matches!(
        mgr.import_skill_from_file(&source),
        Err(Error::DuplicateName(_))
    ));
    // The original is untouched.
    assert_eq!(mgr.get_skill("taken").unwrap().content, "original");
}

#[test]
fn bulk_import_rebuilds_index_once() {
    let (dir, mgr) = bank();
    let incoming = dir.path().join("incoming");
    std::fs::create_dir_all(&incoming).unwrap();
    for i in 0..3 {
        std::fs::write(
            incoming.join(format!("skill_{i}.md")),
            format!("---\nname: skill_{i}\nskill_type: basic\n---\nskill number {i}\n"),
        )
        .unwrap();
    }
    std::fs::write(incoming.join("README.txt"), "not a skill").unwrap();

    let names = mgr.import_skills_from_dir(&incoming).unwrap();
    assert_eq!(names, vec!["skill_0", "skill_1", "skill_2"]);
    assert!(!mgr.search_skills("skill number", 5).unwrap().is_empty());
}

// ── Similar skills and system stats ──────────────────────────

#[test]
fn find_similar_excludes_the_skill_itself() {
    let (_dir, mgr) = bank();
    mgr.add_skill(NewSkill::new("s1", "deploy services to the cloud", SkillType::Basic))
        .unwrap();
    mgr.add_skill(NewSkill::new("s2", "deploy services to staging", SkillType::Basic))
        .unwrap();

    let similar = mgr.find_similar_skills("s1", 5).unwrap();
    assert!(similar.iter().all(|h| h.skill_name != "s1"));
    assert!(similar.iter().any(|h| h.skill_name == "s2"));
}

#[test]
fn system_stats_aggregate_counters() {
    let (_dir, mgr) = bank();
    mgr.add_skill(NewSkill::new("b", "x", SkillType::Basic)).unwrap();
    mgr.add_skill(NewSkill::new("c", "x", SkillType::Composite)).unwrap();
    mgr.add_skill(NewSkill::new("m", "x", SkillType::Meta)).unwrap();
    mgr.record_execution("b", true, None, None).unwrap();
    mgr.record_execution("b", false, None, None).unwrap();

    let stats = mgr.get_system_stats().unwrap();
    assert_eq!(stats.total_skills, 3);
    assert_eq!(stats.basic_skills, 1);
    assert_eq!(stats.composite_skills, 1);
    assert_eq!(stats.meta_skills, 1);
    assert_eq!(stats.total_usage, 2);
    assert_eq!(stats.total_success, 1);
    assert!((stats.success_rate - 0.5).abs() < 1e-9);
    assert_eq!(stats.indexed_vectors, 3);
}

#[test]
fn system_stats_on_empty_bank_are_zero() {
    let (_dir, mgr) = bank();
    let stats = mgr.get_system_stats().unwrap();
    assert_eq!(stats.total_skills, 0);
    assert_eq!(stats.success_rate, 0.0);
    assert_eq!(stats.indexed_vectors, 0);
}
