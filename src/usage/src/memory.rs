use std::sync::atomic::{AtomicU64, Ordering};

/// Global reservation of commit charge. Anything that may later need
/// anonymous memory (private writable mappings, accounted shared mappings,
/// stack growth) reserves pages here up front and gives them back when the
/// region goes away.
pub trait Accountant: std::fmt::Debug + Send + Sync {
    /// Reserves `pages` pages of commit charge. Returns false, with nothing
    /// reserved, if the policy refuses.
    fn reserve(&self, pages: u64) -> bool;

    fn release(&self, pages: u64);

    /// Under strict accounting a caller may not opt out of reservation.
    fn strict(&self) -> bool {
        false
    }
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum OvercommitPolicy {
    /// Refuse only requests that obviously cannot be satisfied.
    Guess,
    Always,
    /// Never commit more than `overcommit_ratio` percent of total pages.
    Never,
}

impl Default for OvercommitPolicy {
    fn default() -> Self {
        OvercommitPolicy::Guess
    }
}

#[derive(Debug)]
pub struct CommitAccounting {
    policy: OvercommitPolicy,
    overcommit_ratio: u64,
    total_pages: u64,
    committed: AtomicU64,
}

impl CommitAccounting {
    pub const DEFAULT_OVERCOMMIT_RATIO: u64 = 50;

    pub fn new(policy: OvercommitPolicy, total_pages: u64) -> Self {
        Self {
            policy,
            overcommit_ratio: Self::DEFAULT_OVERCOMMIT_RATIO,
            total_pages,
            committed: AtomicU64::new(0),
        }
    }

    pub fn with_overcommit_ratio(mut self, ratio: u64) -> Self {
        self.overcommit_ratio = ratio;
        self
    }

    pub fn policy(&self) -> OvercommitPolicy {
        self.policy
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    fn commit_limit(&self) -> u64 {
        self.total_pages.saturating_mul(self.overcommit_ratio) / 100
    }
}

impl Accountant for CommitAccounting {
    fn reserve(&self, pages: u64) -> bool {
        let committed = self.committed.fetch_add(pages, Ordering::SeqCst) + pages;
        let allowed = match self.policy {
            OvercommitPolicy::Always => true,
            OvercommitPolicy::Guess => pages <= self.total_pages,
            OvercommitPolicy::Never => committed <= self.commit_limit(),
        };
        if !allowed {
            self.committed.fetch_sub(pages, Ordering::SeqCst);
            logger::warn!(
                "commit reservation of {} pages refused ({:?}, {} committed)",
                pages,
                self.policy,
                committed - pages
            );
        }
        allowed
    }

    fn release(&self, pages: u64) {
        let prev = self.committed.fetch_sub(pages, Ordering::SeqCst);
        debug_assert!(prev >= pages, "released more pages than were reserved");
    }

    fn strict(&self) -> bool {
        self.policy == OvercommitPolicy::Never
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_respects_ratio() {
        let acct = CommitAccounting::new(OvercommitPolicy::Never, 100).with_overcommit_ratio(50);
        assert!(acct.strict());
        assert!(acct.reserve(40));
        assert!(!acct.reserve(11));
        assert_eq!(acct.committed(), 40);
        assert!(acct.reserve(10));
        acct.release(50);
        assert_eq!(acct.committed(), 0);
    }

    #[test]
    fn guess_and_always() {
        let guess = CommitAccounting::new(OvercommitPolicy::Guess, 100);
        assert!(guess.reserve(100));
        assert!(guess.reserve(100));
        assert!(!guess.reserve(101));
        assert_eq!(guess.committed(), 200);

        let always = CommitAccounting::new(OvercommitPolicy::Always, 0);
        assert!(always.reserve(1 << 40));
        assert!(!always.strict());
    }
}
