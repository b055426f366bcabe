//! Revision graph validation and path planning.
//!
//! Revisions arrive as an unordered set; the chain is rebuilt from parent
//! pointers and must have a single base, no cycles, and a single head.
//! Planning never touches the database.

use std::collections::{BTreeMap, HashMap};

use super::error::{ChainError, MigrationError};
use super::revision::{Direction, Revision, Target};

#[derive(Debug, Clone)]
pub struct RevisionChain {
    /// Revisions in application order, base first.
    ordered: Vec<Revision>,
    positions: HashMap<String, usize>,
}

/// One unit of work in a plan.
#[derive(Debug, Clone, Copy)]
pub struct Step<'a> {
    pub revision: &'a Revision,
    pub direction: Direction,
}

impl<'a> Step<'a> {
    /// The ledger value once this step has committed.
    pub fn ledger_after(&self) -> Option<&'a str> {
        match self.direction {
            Direction::Upgrade => Some(self.revision.id()),
            Direction::Downgrade => self.revision.parent(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plan<'a> {
    pub from: Option<&'a str>,
    pub to: Option<&'a str>,
    pub steps: Vec<Step<'a>>,
}

impl Plan<'_> {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.steps.first().map(|step| step.direction)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Rooted,
}

impl RevisionChain {
    pub fn new(revisions: Vec<Revision>) -> Result<Self, ChainError> {
        let mut by_id: HashMap<&str, &Revision> = HashMap::with_capacity(revisions.len());
        for rev in &revisions {
            if by_id.insert(rev.id(), rev).is_some() {
                return Err(ChainError::DuplicateRevision(rev.id().to_string()));
            }
        }

        // BTreeMap keeps error listings deterministic.
        let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for rev in &revisions {
            if let Some(parent) = rev.parent() {
                if !by_id.contains_key(parent) {
                    return Err(ChainError::MissingParent {
                        revision: rev.id().to_string(),
                        parent: parent.to_string(),
                    });
                }
                children.entry(parent).or_default().push(rev.id());
            }
        }

        detect_cycles(&revisions, &by_id)?;

        let mut bases: Vec<&str> = revisions
            .iter()
            .filter(|rev| rev.is_base())
            .map(Revision::id)
            .collect();
        bases.sort_unstable();
        if bases.len() > 1 {
            return Err(ChainError::MultipleBases(
                bases.into_iter().map(str::to_string).collect(),
            ));
        }

        let mut heads: Vec<&str> = revisions
            .iter()
            .map(Revision::id)
            .filter(|id| !children.contains_key(id))
            .collect();
        heads.sort_unstable();
        if heads.len() > 1 {
            return Err(ChainError::AmbiguousHead(
                heads.into_iter().map(str::to_string).collect(),
            ));
        }

        // Single base, single leaf and every node rooted: the graph is a path.
        let mut order: Vec<&str> = Vec::with_capacity(revisions.len());
        let mut cursor = bases.first().copied();
        while let Some(id) = cursor {
            order.push(id);
            cursor = children.get(id).and_then(|kids| kids.first().copied());
        }

        let mut ordered = Vec::with_capacity(order.len());
        let mut positions = HashMap::with_capacity(order.len());
        for id in order {
            if let Some(rev) = by_id.get(id) {
                positions.insert(id.to_string(), ordered.len());
                ordered.push((*rev).clone());
            }
        }

        Ok(Self { ordered, positions })
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn base(&self) -> Option<&Revision> {
        self.ordered.first()
    }

    pub fn head(&self) -> Option<&Revision> {
        self.ordered.last()
    }

    /// All leaves of the graph. Validation guarantees at most one.
    pub fn heads(&self) -> Vec<&Revision> {
        self.head().into_iter().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Revisions base first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Revision> {
        self.ordered.iter()
    }

    /// Ledger position: 0 is base, `k` means the first `k` revisions are applied.
    pub fn position(&self, current: Option<&str>) -> Result<usize, MigrationError> {
        match current {
            None => Ok(0),
            Some(id) => self
                .positions
                .get(id)
                .map(|pos| pos + 1)
                .ok_or_else(|| MigrationError::DisconnectedChain(id.to_string())),
        }
    }

    /// Resolve a target selector to a ledger position.
    pub fn resolve(&self, target: &Target, current: Option<&str>) -> Result<usize, MigrationError> {
        match target {
            Target::Head => Ok(self.len()),
            Target::Base => Ok(0),
            Target::Revision(id) => self.lookup(id).map(|pos| pos + 1),
            Target::Relative(delta) => {
                let from = self.position(current)? as i64;
                from.checked_add(*delta)
                    .filter(|to| (0..=self.len() as i64).contains(to))
                    .map(|to| to as usize)
                    .ok_or_else(|| MigrationError::RelativeOutOfRange(target.to_string()))
            }
        }
    }

    /// The revision id that a position leaves in the ledger.
    pub fn id_at(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|idx| self.ordered.get(idx))
            .map(Revision::id)
    }

    /// Ordered steps that move the ledger from `current` to `target`.
    pub fn plan(&self, current: Option<&str>, target: &Target) -> Result<Plan<'_>, MigrationError> {
        let to = self.resolve(target, current)?;
        let from = self.position(current)?;

        let steps = if to >= from {
            self.ordered[from..to]
                .iter()
                .map(|revision| Step {
                    revision,
                    direction: Direction::Upgrade,
                })
                .collect()
        } else {
            self.ordered[to..from]
                .iter()
                .rev()
                .map(|revision| Step {
                    revision,
                    direction: Direction::Downgrade,
                })
                .collect()
        };

        Ok(Plan {
            from: self.id_at(from),
            to: self.id_at(to),
            steps,
        })
    }

    fn lookup(&self, id: &str) -> Result<usize, MigrationError> {
        if let Some(&pos) = self.positions.get(id) {
            return Ok(pos);
        }

        let mut candidates: Vec<(usize, &str)> = self
            .ordered
            .iter()
            .enumerate()
            .filter(|(_, rev)| !id.is_empty() && rev.id().starts_with(id))
            .map(|(pos, rev)| (pos, rev.id()))
            .collect();

        match candidates.len() {
            0 => Err(MigrationError::UnknownRevision(id.to_string())),
            1 => Ok(candidates[0].0),
            _ => {
                candidates.sort_unstable_by_key(|(_, candidate)| *candidate);
                Err(MigrationError::AmbiguousRevision {
                    prefix: id.to_string(),
                    candidates: candidates.into_iter().map(|(_, c)| c.to_string()).collect(),
                })
            }
        }
    }
}

/// Walks parent pointers from every revision. A walk that re-enters its own
/// path is a cycle; walks that reach a base or an already-rooted revision are
/// fine. Each revision is visited once overall.
fn detect_cycles(revisions: &[Revision], by_id: &HashMap<&str, &Revision>) -> Result<(), ChainError> {
    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(revisions.len());

    for rev in revisions {
        let mut path = Vec::new();
        let mut cursor = Some(rev.id());

        while let Some(id) = cursor {
            match marks.get(id) {
                Some(Mark::Rooted) => break,
                Some(Mark::OnPath) => return Err(ChainError::CycleDetected(id.to_string())),
                None => {}
            }
            marks.insert(id, Mark::OnPath);
            path.push(id);
            cursor = by_id.get(id).and_then(|r| r.parent());
        }

        for id in path {
            marks.insert(id, Mark::Rooted);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(id: &'static str, parent: Option<&'static str>) -> Revision {
        Revision::new(id, parent, id, "", "")
    }

    fn linear() -> RevisionChain {
        // Deliberately shuffled; ordering comes from parent pointers.
        RevisionChain::new(vec![
            rev("c3", Some("b2")),
            rev("a1", None),
            rev("b2", Some("a1")),
        ])
        .unwrap()
    }

    fn ids<'a>(plan: &Plan<'a>) -> Vec<(&'a str, Direction)> {
        plan.steps
            .iter()
            .map(|s| (s.revision.id(), s.direction))
            .collect()
    }

    #[test]
    fn orders_from_base_to_head() {
        let chain = linear();
        let order: Vec<&str> = chain.iter().map(Revision::id).collect();
        assert_eq!(order, ["a1", "b2", "c3"]);
        assert_eq!(chain.base().unwrap().id(), "a1");
        assert_eq!(chain.head().unwrap().id(), "c3");
    }

    #[test]
    fn empty_chain_is_valid() {
        let chain = RevisionChain::new(Vec::new()).unwrap();
        assert!(chain.is_empty());
        assert!(chain.head().is_none());
        assert!(chain.plan(None, &Target::Head).unwrap().is_empty());
    }

    #[test]
    fn rejects_fork_as_ambiguous_head() {
        let err = RevisionChain::new(vec![
            rev("a1", None),
            rev("b2", Some("a1")),
            rev("b3", Some("a1")),
        ])
        .unwrap_err();
        assert_eq!(err, ChainError::AmbiguousHead(vec!["b2".into(), "b3".into()]));
    }

    #[test]
    fn rejects_cycle() {
        let err = RevisionChain::new(vec![
            rev("a1", None),
            rev("x", Some("y")),
            rev("y", Some("x")),
        ])
        .unwrap_err();
        assert!(matches!(err, ChainError::CycleDetected(_)));
    }

    #[test]
    fn rejects_self_parent() {
        let err = RevisionChain::new(vec![rev("a1", Some("a1"))]).unwrap_err();
        assert_eq!(err, ChainError::CycleDetected("a1".into()));
    }

    #[test]
    fn rejects_missing_parent() {
        let err = RevisionChain::new(vec![rev("a1", None), rev("b2", Some("zz"))]).unwrap_err();
        assert_eq!(
            err,
            ChainError::MissingParent {
                revision: "b2".into(),
                parent: "zz".into()
            }
        );
    }

    #[test]
    fn rejects_two_bases() {
        let err = RevisionChain::new(vec![rev("a1", None), rev("z9", None)]).unwrap_err();
        assert_eq!(err, ChainError::MultipleBases(vec!["a1".into(), "z9".into()]));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = RevisionChain::new(vec![rev("a1", None), rev("a1", None)]).unwrap_err();
        assert_eq!(err, ChainError::DuplicateRevision("a1".into()));
    }

    #[test]
    fn plans_upgrade_from_base() {
        let chain = linear();
        let plan = chain.plan(None, &Target::Head).unwrap();
        assert_eq!(
            ids(&plan),
            [
                ("a1", Direction::Upgrade),
                ("b2", Direction::Upgrade),
                ("c3", Direction::Upgrade)
            ]
        );
        assert_eq!(plan.from, None);
        assert_eq!(plan.to, Some("c3"));
    }

    #[test]
    fn plans_downgrade_in_reverse_order() {
        let chain = linear();
        let plan = chain.plan(Some("c3"), &Target::Revision("a1".into())).unwrap();
        assert_eq!(
            ids(&plan),
            [("c3", Direction::Downgrade), ("b2", Direction::Downgrade)]
        );
        assert_eq!(plan.steps[1].ledger_after(), Some("a1"));
    }

    #[test]
    fn downgrade_to_base_clears_ledger() {
        let chain = linear();
        let plan = chain.plan(Some("b2"), &Target::Base).unwrap();
        assert_eq!(plan.steps.last().unwrap().ledger_after(), None);
        assert_eq!(plan.to, None);
    }

    #[test]
    fn plan_at_target_is_empty() {
        let chain = linear();
        assert!(chain.plan(Some("c3"), &Target::Head).unwrap().is_empty());
        assert!(chain.plan(Some("b2"), &Target::Revision("b2".into())).unwrap().is_empty());
    }

    #[test]
    fn relative_targets_move_from_current() {
        let chain = linear();
        let plan = chain.plan(Some("a1"), &Target::Relative(1)).unwrap();
        assert_eq!(ids(&plan), [("b2", Direction::Upgrade)]);

        let err = chain.plan(Some("c3"), &Target::Relative(1)).unwrap_err();
        assert!(matches!(err, MigrationError::RelativeOutOfRange(_)));
    }

    #[test]
    fn extreme_relative_targets_are_out_of_range() {
        let chain = linear();
        for target in ["+9223372036854775807", "-9223372036854775808"] {
            let err = chain.plan(Some("a1"), &Target::parse(target)).unwrap_err();
            assert!(matches!(err, MigrationError::RelativeOutOfRange(_)), "{target}");
        }
    }

    #[test]
    fn unknown_target_is_reported() {
        let chain = linear();
        let err = chain.plan(None, &Target::Revision("nope".into())).unwrap_err();
        assert!(matches!(err, MigrationError::UnknownRevision(id) if id == "nope"));
    }

    #[test]
    fn unique_prefix_resolves_and_shared_prefix_is_ambiguous() {
        let chain = RevisionChain::new(vec![
            rev("abc1", None),
            rev("abd2", Some("abc1")),
        ])
        .unwrap();
        assert_eq!(chain.resolve(&Target::Revision("abd".into()), None).unwrap(), 2);

        let err = chain.resolve(&Target::Revision("ab".into()), None).unwrap_err();
        assert!(matches!(err, MigrationError::AmbiguousRevision { candidates, .. } if candidates.len() == 2));
    }

    #[test]
    fn ledger_outside_chain_is_disconnected() {
        let chain = linear();
        let err = chain.plan(Some("gone"), &Target::Head).unwrap_err();
        assert!(matches!(err, MigrationError::DisconnectedChain(id) if id == "gone"));
    }
}
