//! In-memory iteration over one materialized chain run.
//!
//! Operations queue up in call order and replay over the fetched
//! instances when a terminal runs; the store is hit exactly once.

use crate::chain::Chain;
use crate::instance::Instance;
use liverow_core::{Cx, Error, Outcome, try_outcome};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

type FilterFn = Arc<dyn Fn(&Instance) -> bool + Send + Sync>;
type VisitFn = Arc<dyn Fn(&Instance) + Send + Sync>;
type SortFn = Arc<dyn Fn(&Instance, &Instance) -> Ordering + Send + Sync>;

enum IterateOp {
    Filter(FilterFn),
    Visit(VisitFn),
    Sort(SortFn),
}

impl fmt::Debug for IterateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterateOp::Filter(_) => write!(f, "Filter"),
            IterateOp::Visit(_) => write!(f, "Visit"),
            IterateOp::Sort(_) => write!(f, "Sort"),
        }
    }
}

/// Queued iteration over a chain's results.
#[derive(Debug)]
pub struct ChainIterate {
    chain: Chain,
    ops: Vec<IterateOp>,
}

impl ChainIterate {
    pub(crate) fn new(chain: Chain) -> Self {
        Self {
            chain,
            ops: Vec::new(),
        }
    }

    /// Keep instances the predicate accepts.
    #[must_use]
    pub fn filter(mut self, predicate: impl Fn(&Instance) -> bool + Send + Sync + 'static) -> Self {
        self.ops.push(IterateOp::Filter(Arc::new(predicate)));
        self
    }

    /// Visit every instance, typically to mutate it before a save.
    #[must_use]
    pub fn visit(mut self, visitor: impl Fn(&Instance) + Send + Sync + 'static) -> Self {
        self.ops.push(IterateOp::Visit(Arc::new(visitor)));
        self
    }

    /// Sort instances in memory with a comparator.
    #[must_use]
    pub fn sort_by(
        mut self,
        comparator: impl Fn(&Instance, &Instance) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.ops.push(IterateOp::Sort(Arc::new(comparator)));
        self
    }

    async fn materialize(&self, cx: &Cx) -> Outcome<Vec<Instance>, Error> {
        let mut instances = try_outcome!(self.chain.run(cx).await);
        for op in &self.ops {
            match op {
                IterateOp::Filter(predicate) => instances.retain(|i| predicate(i)),
                IterateOp::Visit(visitor) => {
                    for instance in &instances {
                        visitor(instance);
                    }
                }
                IterateOp::Sort(comparator) => instances.sort_by(|a, b| comparator(a, b)),
            }
        }
        Outcome::Ok(instances)
    }

    /// Run the chain and replay queued operations.
    pub async fn get(self, cx: &Cx) -> Outcome<Vec<Instance>, Error> {
        self.materialize(cx).await
    }

    /// Number of instances surviving the queued operations.
    pub async fn count(self, cx: &Cx) -> Outcome<usize, Error> {
        let instances = try_outcome!(self.materialize(cx).await);
        Outcome::Ok(instances.len())
    }

    /// Save every surviving instance sequentially.
    pub async fn save(self, cx: &Cx) -> Outcome<Vec<Instance>, Error> {
        let instances = try_outcome!(self.materialize(cx).await);
        for instance in &instances {
            try_outcome!(instance.save(cx).await);
        }
        Outcome::Ok(instances)
    }

    /// Remove every surviving instance sequentially.
    pub async fn remove(self, cx: &Cx) -> Outcome<usize, Error> {
        let instances = try_outcome!(self.materialize(cx).await);
        for instance in &instances {
            try_outcome!(instance.remove(cx).await);
        }
        Outcome::Ok(instances.len())
    }
}
