use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tracing::debug;

use weave_core::error::{Result, WeaveError};
use weave_core::traits::ExecutionStore;
use weave_core::types::{CostFilter, CostRecord, ExecutionResult, Page, TraceNode};

/// Execution store kept in process memory.
///
/// Each collection is bounded by `max_records`; the oldest entries are
/// evicted first once the bound is reached.
pub struct InMemoryStore {
    executions: Mutex<Vec<ExecutionResult>>,
    costs: Mutex<Vec<CostRecord>>,
    traces: Mutex<TraceIndex>,
    max_records: usize,
}

#[derive(Default)]
struct TraceIndex {
    by_execution: HashMap<String, TraceNode>,
    order: Vec<String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            executions: Mutex::new(Vec::new()),
            costs: Mutex::new(Vec::new()),
            traces: Mutex::new(TraceIndex::default()),
            max_records: max_records.max(1),
        }
    }

    fn lock_err<T>(e: std::sync::PoisonError<T>) -> WeaveError {
        WeaveError::Database(format!("store lock poisoned: {}", e))
    }

    fn push_bounded<T>(items: &mut Vec<T>, item: T, max: usize) {
        items.push(item);
        if items.len() > max {
            let excess = items.len() - max;
            items.drain(..excess);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStore for InMemoryStore {
    fn add_execution(&self, result: ExecutionResult) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut executions = self.executions.lock().map_err(Self::lock_err)?;
            debug!(execution_id = %result.execution_id, "Recording execution");
            Self::push_bounded(&mut executions, result, self.max_records);
            Ok(())
        })
    }

    fn get_all_executions(&self) -> BoxFuture<'_, Result<Vec<ExecutionResult>>> {
        Box::pin(async move {
            let executions = self.executions.lock().map_err(Self::lock_err)?;
            Ok(executions.clone())
        })
    }

    fn add_cost(&self, record: CostRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut costs = self.costs.lock().map_err(Self::lock_err)?;
            Self::push_bounded(&mut costs, record, self.max_records);
            Ok(())
        })
    }

    fn get_costs(&self, filter: CostFilter) -> BoxFuture<'_, Result<Page<CostRecord>>> {
        Box::pin(async move {
            let costs = self.costs.lock().map_err(Self::lock_err)?;
            let mut matching: Vec<&CostRecord> = costs.iter().filter(|r| filter.matches(r)).collect();
            // Newest first; insertion order breaks timestamp ties.
            matching.reverse();
            matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

            let total = matching.len();
            let items = matching
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect();

            Ok(Page {
                items,
                total,
                offset: filter.offset,
                limit: filter.limit,
            })
        })
    }

    fn add_trace(&self, execution_id: String, trace: TraceNode) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut traces = self.traces.lock().map_err(Self::lock_err)?;
            if traces.by_execution.insert(execution_id.clone(), trace).is_none() {
                traces.order.push(execution_id);
            }
            if traces.order.len() > self.max_records {
                let oldest = traces.order.remove(0);
                traces.by_execution.remove(&oldest);
            }
            Ok(())
        })
    }

    fn get_trace(&self, execution_id: String) -> BoxFuture<'_, Result<Option<TraceNode>>> {
        Box::pin(async move {
            let traces = self.traces.lock().map_err(Self::lock_err)?;
            Ok(traces.by_execution.get(&execution_id).cloned())
        })
    }
}
