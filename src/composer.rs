//! Task-driven composition planner.
//!
//! Given a natural-language task, retrieves candidate skills from the
//! vector index, closes over their declared dependencies (breaking cycles),
//! orders the result topologically and truncates it to the requested size.
//! Also scores how well the current bank covers a task and proposes
//! alternative tier-first plans.
//!
//! Every entry point degrades to empty/zero results over an empty store or
//! a vector-less index; none of them error for those states.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::debug;

use crate::error::{Error, Result};
use crate::index::{Hit, VectorIndex};
use crate::repository::Repository;
use crate::skill::{Skill, SkillType};

/// Candidates fetched per requested plan slot, floored at 15.
const CANDIDATE_FACTOR: usize = 3;
const CANDIDATE_FLOOR: usize = 15;
/// Plan size used by `suggest_compositions`.
const SUGGESTION_PLAN_SIZE: usize = 5;

/// Coverage weights per tier.
const META_WEIGHT: f64 = 0.4;
const COMPOSITE_WEIGHT: f64 = 0.35;
const BASIC_WEIGHT: f64 = 0.25;

/// One entry of a composed plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub skill: Skill,
    /// Vector score of the candidate, `0.0` for skills pulled in only as
    /// dependencies.
    pub relevance_score: f32,
    pub step_index: usize,
}

/// An ordered, dependency-respecting skill sequence.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.skill.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of [`Composer::validate_composition`].
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub skill_count: usize,
}

/// Outcome of [`Composer::analyze_coverage`].
#[derive(Debug, Clone)]
pub struct CoverageReport {
    pub overall_coverage: f64,
    pub meta_coverage: f64,
    pub composite_coverage: f64,
    pub basic_coverage: f64,
    pub recommendation: String,
}

/// Per-tier results of [`Composer::hierarchical_search`].
#[derive(Debug, Clone, Default)]
pub struct TieredHits {
    pub meta: Vec<Hit>,
    pub composite: Vec<Hit>,
    pub basic: Vec<Hit>,
}

/// Stateless planner borrowing the store and the index.
pub struct Composer<'a> {
    repo: &'a Repository,
    index: &'a VectorIndex,
}

impl<'a> Composer<'a> {
    pub fn new(repo: &'a Repository, index: &'a VectorIndex) -> Self {
        Self { repo, index }
    }

    /// Compose an ordered plan of at most `max_skills` skills for `task`.
    pub fn compose_for_task(&self, task: &str, max_skills: usize) -> Result<Plan> {
        if max_skills == 0 {
            return Ok(Plan::default());
        }
        let k = max_skills
            .saturating_mul(CANDIDATE_FACTOR)
            .max(CANDIDATE_FLOOR);
        let hits = self.index.query(task, k, None)?;
        debug!(task, candidates = hits.len(), "composing plan");
        self.plan_from_candidates(&hits, max_skills)
    }

    /// Check a plan against the live store: no duplicates, every skill
    /// still known, every dependency either placed earlier or flagged in
    /// the plan's warnings.
    pub fn validate_composition(&self, plan: &Plan) -> Validation {
        let mut issues = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();
        for (i, step) in plan.steps.iter().enumerate() {
            if position.insert(step.skill.name.as_str(), i).is_some() {
                issues.push(format!("duplicate skill {:?} in plan", step.skill.name));
            }
        }

        for (i, step) in plan.steps.iter().enumerate() {
            let name = &step.skill.name;
            let current = match self.repo.get_skill(name) {
                Ok(s) => s,
                Err(Error::UnknownSkill(_)) => {
                    issues.push(format!("skill {name:?} is no longer in the store"));
                    continue;
                }
                Err(e) => {
                    issues.push(format!("skill {name:?} could not be checked: {e}"));
                    continue;
                }
            };
            for dep in &current.dependencies {
                let flagged = plan.warnings.iter().any(|w| w.contains(dep.as_str()));
                match position.get(dep.as_str()) {
                    Some(pos) if *pos < i => {}
                    _ if flagged => {}
                    Some(_) => issues.push(format!(
                        "dependency {dep:?} of {name:?} appears later in the plan"
                    )),
                    None => issues.push(format!(
                        "dependency {dep:?} of {name:?} is missing from the plan"
                    )),
                }
            }
        }

        Validation {
            valid: issues.is_empty(),
            issues,
            warnings: plan.warnings.clone(),
            skill_count: plan.steps.len(),
        }
    }

    /// Score how well the bank covers `task`: best vector score per tier,
    /// weighted meta 0.4 / composite 0.35 / basic 0.25.
    pub fn analyze_coverage(&self, task: &str) -> Result<CoverageReport> {
        let top = |tier| -> Result<f64> {
            let hits = self.index.query(task, 5, Some(tier))?;
            Ok(hits
                .first()
                .map(|h| (h.score as f64).clamp(0.0, 1.0))
                .unwrap_or(0.0))
        };
        let meta = top(SkillType::Meta)?;
        let composite = top(SkillType::Composite)?;
        let basic = top(SkillType::Basic)?;
        let overall = META_WEIGHT * meta + COMPOSITE_WEIGHT * composite + BASIC_WEIGHT * basic;

        let recommendation = if overall < 0.4 {
            "Insufficient coverage: add or import skills for this task before composing."
        } else if overall <= 0.7 {
            "Partial coverage: a composition is possible but may need manual gap-filling."
        } else {
            "Good coverage: existing skills plausibly solve this task."
        };

        Ok(CoverageReport {
            overall_coverage: overall,
            meta_coverage: meta,
            composite_coverage: composite,
            basic_coverage: basic,
            recommendation: recommendation.to_string(),
        })
    }

    /// Up to `n` alternative plans: meta-first, composite-first and
    /// basic-first candidate pools, deduplicated by name sequence.
    pub fn suggest_compositions(&self, task: &str, n: usize) -> Result<Vec<Plan>> {
        let mut plans = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for tier in [SkillType::Meta, SkillType::Composite, SkillType::Basic] {
            if plans.len() >= n {
                break;
            }
            let hits = self.index.query(task, CANDIDATE_FLOOR, Some(tier))?;
            if hits.is_empty() {
                continue;
            }
            let plan = self.plan_from_candidates(&hits, SUGGESTION_PLAN_SIZE)?;
            if plan.is_empty() {
                continue;
            }
            let key = plan.names().join("\u{1f}");
            if seen.insert(key) {
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    /// Independent filtered queries, one per tier, `per_level` hits each.
    pub fn hierarchical_search(&self, query: &str, per_level: usize) -> Result<TieredHits> {
        Ok(TieredHits {
            meta: self.index.query(query, per_level, Some(SkillType::Meta))?,
            composite: self
                .index
                .query(query, per_level, Some(SkillType::Composite))?,
            basic: self.index.query(query, per_level, Some(SkillType::Basic))?,
        })
    }

    // ── Planning internals ──────────────────────────────────

    fn plan_from_candidates(&self, hits: &[Hit], max_skills: usize) -> Result<Plan> {
        // Hydrate and rank the retrieved candidates, dropping anything that
        // has disappeared from the store since indexing.
        let mut relevance: HashMap<String, (usize, f32)> = HashMap::new();
        let mut candidates: Vec<String> = Vec::new();
        for hit in hits {
            if relevance.contains_key(&hit.name) {
                continue;
            }
            if self.repo.get_skill(&hit.name).is_err() {
                continue;
            }
            relevance.insert(hit.name.clone(), (candidates.len(), hit.score));
            candidates.push(hit.name.clone());
        }
        if candidates.is_empty() {
            return Ok(Plan::default());
        }

        // Dependency closure with cycle breaking.
        let mut nodes: HashMap<String, Skill> = HashMap::new();
        let mut kept_edges: HashMap<String, Vec<String>> = HashMap::new();
        let mut warnings: Vec<String> = Vec::new();
        {
            let mut in_progress: HashSet<String> = HashSet::new();
            let mut done: HashSet<String> = HashSet::new();
            for name in &candidates {
                self.close_over(
                    name,
                    &mut nodes,
                    &mut kept_edges,
                    &mut in_progress,
                    &mut done,
                    &mut warnings,
                )?;
            }
        }

        // Kahn's algorithm; ties broken by (tier rank, candidate rank, name)
        // so dependencies and better matches surface first.
        let key = |name: &str| -> (u8, usize, String) {
            let tier = nodes[name].skill_type.rank();
            let rank = relevance.get(name).map(|(r, _)| *r).unwrap_or(usize::MAX);
            (tier, rank, name.to_string())
        };

        let mut indegree: HashMap<String, usize> = nodes.keys().map(|n| (n.clone(), 0)).collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (from, deps) in &kept_edges {
            for dep in deps {
                *indegree.get_mut(from).expect("node indexed") += 1;
                dependents.entry(dep.clone()).or_default().push(from.clone());
            }
        }

        let mut ready: BinaryHeap<Reverse<(u8, usize, String)>> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| Reverse(key(n)))
            .collect();
        let mut order: Vec<String> = Vec::with_capacity(nodes.len());
        while let Some(Reverse((_, _, name))) = ready.pop() {
            for dependent in dependents.get(&name).cloned().unwrap_or_default() {
                let d = indegree.get_mut(&dependent).expect("node indexed");
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(key(&dependent)));
                }
            }
            order.push(name);
        }
        if order.len() < nodes.len() {
            let mut leftover: Vec<String> = nodes
                .keys()
                .filter(|n| !order.contains(*n))
                .cloned()
                .collect();
            leftover.sort_by_key(|n| key(n));
            warnings.push(format!(
                "dependency cycle could not be fully ordered; appending {} skills",
                leftover.len()
            ));
            order.extend(leftover);
        }

        let order = truncate_order(order, &kept_edges, max_skills);

        let steps = order
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let skill = nodes.remove(&name).expect("ordered node hydrated");
                let score = relevance
                    .get(&skill.name)
                    .map(|(_, s)| s.clamp(0.0, 1.0))
                    .unwrap_or(0.0);
                PlanStep {
                    skill,
                    relevance_score: score,
                    step_index: i,
                }
            })
            .collect();
        Ok(Plan { steps, warnings })
    }

    /// Depth-first closure over declared dependencies. An edge that would
    /// re-enter the in-progress stack is omitted and reported; edges to
    /// vanished skills are skipped likewise.
    fn close_over(
        &self,
        name: &str,
        nodes: &mut HashMap<String, Skill>,
        kept_edges: &mut HashMap<String, Vec<String>>,
        in_progress: &mut HashSet<String>,
        done: &mut HashSet<String>,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if !nodes.contains_key(name) {
            match self.repo.get_skill(name) {
                Ok(skill) => {
                    nodes.insert(name.to_string(), skill);
                }
                Err(Error::UnknownSkill(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        in_progress.insert(name.to_string());

        let deps = nodes[name].dependencies.clone();
        for dep in deps {
            if in_progress.contains(&dep) {
                warnings.push(format!("dependency cycle broken: {name} -> {dep}"));
                continue;
            }
            if !nodes.contains_key(&dep) {
                match self.repo.get_skill(&dep) {
                    Ok(skill) => {
                        nodes.insert(dep.clone(), skill);
                    }
                    Err(Error::UnknownSkill(_)) => {
                        warnings.push(format!("dependency {dep} of {name} is not in the store"));
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            kept_edges
                .entry(name.to_string())
                .or_default()
                .push(dep.clone());
            self.close_over(&dep, nodes, kept_edges, in_progress, done, warnings)?;
        }

        in_progress.remove(name);
        done.insert(name.to_string());
        Ok(())
    }
}

/// Keep the first `max` entries of a topological order, then drop any
/// retained skill whose kept dependency was truncated away, to a fixpoint.
fn truncate_order(
    order: Vec<String>,
    kept_edges: &HashMap<String, Vec<String>>,
    max: usize,
) -> Vec<String> {
    if order.len() <= max {
        return order;
    }
    let mut retained: Vec<String> = order.into_iter().take(max).collect();
    loop {
        let present: HashSet<String> = retained.iter().cloned().collect();
        let before = retained.len();
        retained.retain(|name| {
            kept_edges
                .get(name)
                .map(|deps| deps.iter().all(|d| present.contains(d.as_str())))
                .unwrap_or(true)
        });
        if retained.len() == before {
            return retained;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{Embedder, EmbedderFactory, HashingEmbedder};
    use crate::index::IndexParams;
    use crate::skill::NewSkill;

    const DIM: usize = 64;

    struct Bank {
        _dir: tempfile::TempDir,
        repo: Repository,
        index: VectorIndex,
    }

    impl Bank {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let repo = Repository::open(&dir.path().join("skills.db")).unwrap();
            let factory: EmbedderFactory =
                Box::new(|| Ok(Box::new(HashingEmbedder::new(DIM)) as Box<dyn Embedder>));
            let params = IndexParams {
                dim: DIM,
                ..IndexParams::default()
            };
            let index = VectorIndex::new(dir.path().join("index"), params, factory);
            Self {
                _dir: dir,
                repo,
                index,
            }
        }

        fn add(&self, name: &str, skill_type: SkillType, content: &str, deps: &[&str]) {
            let skill = NewSkill::new(name, content, skill_type)
                .with_dependencies(deps.iter().copied());
            self.repo.add_skill(&skill).unwrap();
            self.index
                .add(name, skill_type, &format!("{name}\n{content}"))
                .unwrap();
        }

        fn composer(&self) -> Composer<'_> {
            Composer::new(&self.repo, &self.index)
        }
    }

    #[test]
    fn empty_bank_composes_empty_plan() {
        let bank = Bank::new();
        let plan = bank.composer().compose_for_task("anything at all", 5).unwrap();
        assert!(plan.is_empty());
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn max_skills_zero_short_circuits() {
        let bank = Bank::new();
        bank.add("a", SkillType::Basic, "alpha", &[]);
        let plan = bank.composer().compose_for_task("alpha", 0).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn dependency_chain_orders_before_dependents() {
        let bank = Bank::new();
        bank.add("a", SkillType::Basic, "prepare environment variables", &[]);
        bank.add("b", SkillType::Basic, "build the c binary", &["a"]);
        bank.add("c", SkillType::Composite, "run c end to end", &["b"]);

        let plan = bank.composer().compose_for_task("run c", 5).unwrap();
        assert_eq!(plan.names(), vec!["a", "b", "c"]);
        let indices: Vec<usize> = plan.steps.iter().map(|s| s.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn dependency_only_skills_carry_zero_relevance() {
        let bank = Bank::new();
        // `setup` exists in the store but was never indexed, so it can only
        // enter the plan through the dependency closure.
        bank.repo
            .add_skill(&NewSkill::new("setup", "unindexed body", SkillType::Basic))
            .unwrap();
        bank.add(
            "deploy",
            SkillType::Composite,
            "deploy the application to production",
            &["setup"],
        );

        let plan = bank
            .composer()
            .compose_for_task("deploy the application to production", 5)
            .unwrap();
        assert_eq!(plan.names(), vec!["setup", "deploy"]);
        assert_eq!(plan.steps[0].relevance_score, 0.0);
        assert!(plan.steps[1].relevance_score > 0.0);
    }

    #[test]
    fn cycle_is_broken_with_warning() {
        let bank = Bank::new();
        bank.add("a", SkillType::Basic, "first of the pair", &[]);
        bank.add("b", SkillType::Basic, "second of the pair", &["a"]);
        bank.repo.set_dependencies("a", &["b".into()]).unwrap();

        let plan = bank.composer().compose_for_task("pair", 5).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(
            plan.warnings.iter().any(|w| w.contains("cycle")),
            "expected a cycle warning, got {:?}",
            plan.warnings
        );
        // Whatever orientation survived, the validation must accept it.
        let validation = bank.composer().validate_composition(&plan);
        assert!(validation.valid, "issues: {:?}", validation.issues);
    }

    #[test]
    fn truncation_respects_max_skills() {
        let bank = Bank::new();
        bank.add("a", SkillType::Basic, "shared vocabulary words", &[]);
        bank.add("b", SkillType::Basic, "shared vocabulary words", &["a"]);
        bank.add("c", SkillType::Composite, "shared vocabulary words", &["b"]);

        let plan = bank
            .composer()
            .compose_for_task("shared vocabulary words", 2)
            .unwrap();
        assert_eq!(plan.names(), vec!["a", "b"]);
    }

    #[test]
    fn truncate_order_drops_orphaned_dependents() {
        // Artificial out-of-order input: `late_dep` sits beyond the cut, so
        // its dependent must go too, cascading to the end of the chain.
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        edges.insert("mid".into(), vec!["late_dep".into()]);
        edges.insert("top".into(), vec!["mid".into()]);
        let order = vec![
            "keep".to_string(),
            "mid".to_string(),
            "top".to_string(),
            "late_dep".to_string(),
        ];
        let kept = truncate_order(order, &edges, 3);
        assert_eq!(kept, vec!["keep"]);
    }

    #[test]
    fn validation_flags_reordered_dependency() {
        let bank = Bank::new();
        bank.add("a", SkillType::Basic, "one", &[]);
        bank.add("b", SkillType::Basic, "two", &["a"]);
        let mut plan = bank.composer().compose_for_task("one two", 5).unwrap();
        assert_eq!(plan.names(), vec!["a", "b"]);

        plan.steps.swap(0, 1);
        let validation = bank.composer().validate_composition(&plan);
        assert!(!validation.valid);
        assert!(validation.issues.iter().any(|i| i.contains("later")));
        assert_eq!(validation.skill_count, 2);
    }

    #[test]
    fn validation_flags_vanished_skill() {
        let bank = Bank::new();
        bank.add("a", SkillType::Basic, "one", &[]);
        let plan = bank.composer().compose_for_task("one", 5).unwrap();
        assert_eq!(plan.names(), vec!["a"]);

        bank.repo.delete_skill("a").unwrap();
        let validation = bank.composer().validate_composition(&plan);
        assert!(!validation.valid);
        assert!(validation
            .issues
            .iter()
            .any(|i| i.contains("no longer in the store")));
    }

    #[test]
    fn coverage_on_empty_bank_is_insufficient() {
        let bank = Bank::new();
        let report = bank.composer().analyze_coverage("deploy app").unwrap();
        assert_eq!(report.overall_coverage, 0.0);
        assert_eq!(report.meta_coverage, 0.0);
        assert!(report.recommendation.contains("Insufficient"));
    }

    #[test]
    fn coverage_stays_within_unit_interval() {
        let bank = Bank::new();
        bank.add("m", SkillType::Meta, "deploy app to the cloud", &[]);
        bank.add("c", SkillType::Composite, "deploy app with checks", &[]);
        bank.add("b", SkillType::Basic, "deploy app binary", &[]);

        let report = bank.composer().analyze_coverage("deploy app").unwrap();
        assert!(report.overall_coverage > 0.0);
        assert!(report.overall_coverage <= 1.0);
        for tier in [
            report.meta_coverage,
            report.composite_coverage,
            report.basic_coverage,
        ] {
            assert!((0.0..=1.0).contains(&tier));
        }
    }

    #[test]
    fn hierarchical_search_partitions_tiers() {
        let bank = Bank::new();
        bank.add("m", SkillType::Meta, "release orchestration plan", &[]);
        bank.add("c", SkillType::Composite, "release build pipeline", &[]);
        bank.add("b1", SkillType::Basic, "release notes writer", &[]);
        bank.add("b2", SkillType::Basic, "release tag pusher", &[]);

        let tiers = bank.composer().hierarchical_search("release", 1).unwrap();
        assert_eq!(tiers.meta.len(), 1);
        assert_eq!(tiers.composite.len(), 1);
        assert_eq!(tiers.basic.len(), 1);
        assert_eq!(tiers.meta[0].name, "m");
        assert_eq!(tiers.composite[0].name, "c");
    }

    #[test]
    fn suggestions_are_distinct_plans() {
        let bank = Bank::new();
        // One skill per tier, chained so every strategy expands to the
        // same final sequence.
        bank.add("base", SkillType::Basic, "ship the release", &[]);
        bank.add("steps", SkillType::Composite, "ship the release", &["base"]);
        bank.add("plan", SkillType::Meta, "ship the release", &["steps"]);

        let plans = bank
            .composer()
            .suggest_compositions("ship the release", 3)
            .unwrap();
        assert!(!plans.is_empty());
        let mut sequences: Vec<Vec<&str>> = plans.iter().map(|p| p.names()).collect();
        sequences.sort();
        sequences.dedup();
        assert_eq!(sequences.len(), plans.len(), "plans must be distinct");
    }

    #[test]
    fn suggestions_on_empty_bank_are_empty() {
        let bank = Bank::new();
        assert!(bank
            .composer()
            .suggest_compositions("anything", 3)
            .unwrap()
            .is_empty());
    }
}
