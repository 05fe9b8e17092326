//! Resource tokens gating job dispatch.
//!
//! Each queue declares the tokens one of its jobs holds while running; the
//! scheduler admits a job only when every token is free. The cache token
//! can additionally be held exclusively, which is how a cleanup job keeps
//! builds from racing eviction.

/// A schedulable resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Cache,
    Download,
    Process,
    Upload,
}

const RESOURCE_COUNT: usize = 4;

impl ResourceType {
    fn index(self) -> usize {
        match self {
            Self::Cache => 0,
            Self::Download => 1,
            Self::Process => 2,
            Self::Upload => 3,
        }
    }
}

/// Token accounting across all running jobs.
#[derive(Debug)]
pub struct Resources {
    limits: [usize; RESOURCE_COUNT],
    used: [usize; RESOURCE_COUNT],
    exclusive: [bool; RESOURCE_COUNT],
}

impl Resources {
    /// Limits: builds bounded by `builders`, network transfers by
    /// `fetchers`/`pushers`. Cache tokens are not limited in number, only
    /// by exclusive holds.
    #[must_use]
    pub fn new(builders: usize, fetchers: usize, pushers: usize) -> Self {
        let mut limits = [usize::MAX; RESOURCE_COUNT];
        limits[ResourceType::Download.index()] = fetchers;
        limits[ResourceType::Process.index()] = builders;
        limits[ResourceType::Upload.index()] = pushers;
        Self {
            limits,
            used: [0; RESOURCE_COUNT],
            exclusive: [false; RESOURCE_COUNT],
        }
    }

    /// Try to reserve the given tokens; either all are taken or none.
    pub fn reserve(&mut self, resources: &[ResourceType]) -> bool {
        let can = resources.iter().all(|r| {
            let idx = r.index();
            !self.exclusive[idx] && self.used[idx] < self.limits[idx]
        });
        if can {
            for r in resources {
                self.used[r.index()] += 1;
            }
        }
        can
    }

    /// Try to reserve one token exclusively: no other job may hold it.
    pub fn reserve_exclusive(&mut self, resource: ResourceType) -> bool {
        let idx = resource.index();
        if self.exclusive[idx] || self.used[idx] > 0 {
            return false;
        }
        self.exclusive[idx] = true;
        self.used[idx] = 1;
        true
    }

    pub fn release(&mut self, resources: &[ResourceType]) {
        for r in resources {
            let idx = r.index();
            debug_assert!(self.used[idx] > 0);
            self.used[idx] = self.used[idx].saturating_sub(1);
        }
    }

    pub fn release_exclusive(&mut self, resource: ResourceType) {
        let idx = resource.index();
        self.exclusive[idx] = false;
        self.used[idx] = self.used[idx].saturating_sub(1);
    }
}
