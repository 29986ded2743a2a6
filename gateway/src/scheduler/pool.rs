//! Upstream pool with round-robin, skip-if-saturated selection.

use llm_gateway_common::UpstreamHealth;

/// A backend inference server and its live load.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    /// Position in the pool.
    pub id: usize,
    /// Base URL, without trailing slash.
    pub base: String,
    /// Requests currently dispatched to this target.
    active: usize,
    /// Ceiling on `active`. `None` means unbounded.
    limit: Option<usize>,
}

impl UpstreamTarget {
    pub fn active(&self) -> usize {
        self.active
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn has_capacity(&self) -> bool {
        self.limit.map_or(true, |limit| self.active < limit)
    }

    fn health(&self) -> UpstreamHealth {
        UpstreamHealth {
            base: self.base.clone(),
            active: self.active,
            limit: self.limit,
        }
    }
}

/// Fixed list of upstream targets plus the shared round-robin cursor.
///
/// Selection is the only place the cursor moves, so direct admissions and
/// queue drains share the same rotation.
#[derive(Debug)]
pub struct UpstreamPool {
    targets: Vec<UpstreamTarget>,
    /// Index of the last candidate examined. `None` until the first selection.
    cursor: Option<usize>,
}

impl UpstreamPool {
    /// Create a pool where every target has the same ceiling.
    pub fn new(bases: Vec<String>, limit: Option<usize>) -> Self {
        let targets = bases
            .into_iter()
            .enumerate()
            .map(|(id, base)| UpstreamTarget {
                id,
                base,
                active: 0,
                limit,
            })
            .collect();
        Self {
            targets,
            cursor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&UpstreamTarget> {
        self.targets.get(id)
    }

    /// Pick the next target with a free slot, starting one past the cursor.
    ///
    /// Examines at most `len()` candidates and advances the cursor past every
    /// candidate examined, even when all of them are saturated.
    pub fn select(&mut self) -> Option<usize> {
        let total = self.targets.len();
        for _ in 0..total {
            let next = self.cursor.map_or(0, |c| (c + 1) % total);
            self.cursor = Some(next);
            if self.targets[next].has_capacity() {
                return Some(next);
            }
        }
        None
    }

    pub(super) fn acquire(&mut self, id: usize) {
        if let Some(target) = self.targets.get_mut(id) {
            target.active += 1;
        }
    }

    pub(super) fn release(&mut self, id: usize) {
        if let Some(target) = self.targets.get_mut(id) {
            target.active = target.active.saturating_sub(1);
        }
    }

    pub fn total_active(&self) -> usize {
        self.targets.iter().map(|t| t.active).sum()
    }

    pub fn health(&self) -> Vec<UpstreamHealth> {
        self.targets.iter().map(UpstreamTarget::health).collect()
    }
}
