//! Request-scoped state.
//!
//! The resource tree is shared and immutable; anything a plugin needs to remember
//! between resolve and `modified` for one request lives here instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::{ResourceError, ResourceResult};
use crate::hierarchy::HierarchyPath;
use crate::kvp::{parse_kvp, KvpMap};
use crate::operation::OperationType;

/// Rule-result key selecting the compound stage policy.
pub const STAGE_POLICY_KEY: &str = "stage_to_cache_policy";
/// Rule-result key overriding the rebalance page size.
pub const REPL_LIMIT_KEY: &str = "repl_limit";

/// Siblings that must receive a replica once the selected child has been written.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationPlan {
    /// Operation the plan was recorded for.
    pub operation: OperationType,
    /// Logical path of the object.
    pub logical_path: String,
    /// Hierarchy chosen by the vote.
    pub selected: HierarchyPath,
    /// Hierarchies of the other children that voted above zero.
    pub siblings: Vec<HierarchyPath>,
}

impl ReplicationPlan {
    /// Whether a plan recorded for `self.operation` may be followed by `next`.
    pub fn accepts(&self, next: OperationType) -> bool {
        use OperationType::*;
        matches!(
            (self.operation, next),
            (Create, Create) | (Create, Write) | (Write, Write) | (Unlink, Unlink)
        )
    }
}

/// State carried through one client request.
pub struct RequestContext {
    request_id: Uuid,
    local_host: String,
    rule_results: KvpMap,
    catalog: Arc<dyn Catalog>,
    clock: Option<u64>,
    plans: HashMap<String, ReplicationPlan>,
    noted: HashMap<String, OperationType>,
}

impl RequestContext {
    /// A fresh context for a request arriving at `local_host`.
    pub fn new(local_host: impl Into<String>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            local_host: local_host.into(),
            rule_results: KvpMap::new(),
            catalog,
            clock: None,
            plans: HashMap::new(),
            noted: HashMap::new(),
        }
    }

    /// Replaces the rule results with the parsed KVP string.
    pub fn with_rule_results(mut self, results: &str) -> ResourceResult<Self> {
        self.rule_results = parse_kvp(results)?;
        Ok(self)
    }

    /// Sets a single rule result.
    pub fn set_rule_result(&mut self, key: &str, value: &str) {
        self.rule_results.insert(key.to_string(), value.to_string());
    }

    /// Pins the clock to `now` (Unix seconds).
    pub fn with_clock(mut self, now: u64) -> Self {
        self.clock = Some(now);
        self
    }

    /// Identifier for log correlation.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Host the request is being served on.
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Rule-result value for `key`.
    pub fn rule_result(&self, key: &str) -> Option<&str> {
        self.rule_results.get(key).map(String::as_str)
    }

    /// Rule-result value parsed as a number; `None` when absent.
    pub fn rule_result_parsed<T: std::str::FromStr>(&self, key: &str) -> ResourceResult<Option<T>> {
        match self.rule_result(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                ResourceError::bad_input(format!("rule result {key}={raw:?} is not a number"))
            }),
        }
    }

    /// The catalog.
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Current Unix time in seconds.
    pub fn now_secs(&self) -> u64 {
        self.clock.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        })
    }

    /// Records a replication plan for `resource`, replacing any previous one.
    ///
    /// A previous plan for the same object must accept the new operation.
    pub fn record_plan(&mut self, resource: &str, plan: ReplicationPlan) -> ResourceResult<()> {
        if let Some(existing) = self.plans.get(resource) {
            if existing.logical_path == plan.logical_path && !existing.accepts(plan.operation) {
                return Err(ResourceError::InvalidOperation {
                    resource: resource.to_string(),
                    operation: plan.operation.to_string(),
                    msg: format!(
                        "pending {} replication of {} is incompatible",
                        existing.operation, existing.logical_path
                    ),
                });
            }
        }
        self.plans.insert(resource.to_string(), plan);
        Ok(())
    }

    /// The pending plan for `resource`.
    pub fn plan(&self, resource: &str) -> Option<&ReplicationPlan> {
        self.plans.get(resource)
    }

    /// Removes and returns the pending plan for `resource`.
    pub fn take_plan(&mut self, resource: &str) -> Option<ReplicationPlan> {
        self.plans.remove(resource)
    }

    /// Notes the operation type announced to `resource`.
    pub fn note_operation(&mut self, resource: &str, operation: OperationType) {
        self.noted.insert(resource.to_string(), operation);
    }

    /// The operation type last announced to `resource`.
    pub fn noted_operation(&self, resource: &str) -> Option<OperationType> {
        self.noted.get(resource).copied()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("local_host", &self.local_host)
            .field("rule_results", &self.rule_results)
            .field("plans", &self.plans)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MockCatalog;

    fn ctx() -> RequestContext {
        RequestContext::new("host1", Arc::new(MockCatalog::new()))
    }

    fn plan(op: OperationType) -> ReplicationPlan {
        ReplicationPlan {
            operation: op,
            logical_path: "/zone/o".to_string(),
            selected: HierarchyPath::from_string("repl;a").unwrap(),
            siblings: vec![],
        }
    }

    #[test]
    fn test_plan_compatibility() {
        assert!(plan(OperationType::Create).accepts(OperationType::Write));
        assert!(plan(OperationType::Write).accepts(OperationType::Write));
        assert!(!plan(OperationType::Write).accepts(OperationType::Create));
        assert!(!plan(OperationType::Write).accepts(OperationType::Unlink));
        assert!(plan(OperationType::Unlink).accepts(OperationType::Unlink));
    }

    #[test]
    fn test_record_plan_rejects_incompatible() {
        let mut ctx = ctx();
        ctx.record_plan("repl", plan(OperationType::Write)).unwrap();
        let err = ctx.record_plan("repl", plan(OperationType::Unlink)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidOperation);
        assert_eq!(ctx.plan("repl").unwrap().operation, OperationType::Write);
        assert!(ctx.take_plan("repl").is_some());
        assert!(ctx.plan("repl").is_none());
    }

    #[test]
    fn test_rule_results() {
        let ctx = ctx()
            .with_rule_results("stage_to_cache_policy=prefer_archive;repl_limit=25")
            .unwrap();
        assert_eq!(ctx.rule_result(STAGE_POLICY_KEY), Some("prefer_archive"));
        assert_eq!(ctx.rule_result_parsed::<usize>(REPL_LIMIT_KEY).unwrap(), Some(25));
        assert_eq!(ctx.rule_result_parsed::<usize>("absent").unwrap(), None);
    }

    #[test]
    fn test_bad_number() {
        let mut ctx = ctx();
        ctx.set_rule_result(REPL_LIMIT_KEY, "lots");
        assert!(ctx.rule_result_parsed::<usize>(REPL_LIMIT_KEY).is_err());
    }

    #[test]
    fn test_clock_override() {
        let ctx = ctx().with_clock(1_000);
        assert_eq!(ctx.now_secs(), 1_000);
        assert_ne!(
            ctx.request_id(),
            RequestContext::new("h", Arc::new(MockCatalog::new())).request_id()
        );
    }
}
