use crate::audit::{AuditEntry, AuditLog};
use crate::document::{PolicyDocument, ResourceType};
use crate::rate::{RateKey, RateLimiter};
use chrono::Utc;
use maestro_core::{CoreError, DenySubcode, TransactionContext};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::warn;

/// Restrictions the caller must honor on an allowed invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppliedRestrictions {
    pub max_execution_time_seconds: Option<u64>,
}

impl AppliedRestrictions {
    pub fn max_execution_time(&self) -> Option<Duration> {
        self.max_execution_time_seconds.map(Duration::from_secs)
    }
}

/// Verdict of one evaluation. `reason` is free text drawn from a finite set
/// of phrasings; `subcode` is the stable machine-readable refusal cause.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub subcode: Option<DenySubcode>,
    pub applied_restrictions: AppliedRestrictions,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>, applied: AppliedRestrictions) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            subcode: None,
            applied_restrictions: applied,
        }
    }

    fn deny(subcode: DenySubcode, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            subcode: Some(subcode),
            applied_restrictions: AppliedRestrictions::default(),
        }
    }

    /// The denial as an error, for callers that propagate.
    pub fn to_error(&self) -> CoreError {
        CoreError::denied(
            self.subcode.unwrap_or(DenySubcode::DefaultDeny),
            self.reason.clone(),
        )
    }
}

/// Evaluates allow/deny per invocation from the active document plus the
/// caller's role. The document is swapped atomically on reload; every
/// evaluation runs against the snapshot it took first.
pub struct PolicyEngine {
    active: RwLock<Arc<PolicyDocument>>,
    rates: RateLimiter,
    audit: Arc<AuditLog>,
}

impl PolicyEngine {
    pub fn new(document: PolicyDocument, audit: Arc<AuditLog>) -> Self {
        Self {
            active: RwLock::new(Arc::new(document)),
            rates: RateLimiter::hourly(),
            audit,
        }
    }

    /// Handle to the active document. In-flight evaluations keep whatever
    /// snapshot they took; no reader ever sees a mix of old and new rules.
    pub fn snapshot(&self) -> Arc<PolicyDocument> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publish a new document at a single swap point.
    pub fn swap(&self, document: PolicyDocument) {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(document);
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn evaluate(
        &self,
        ctx: &TransactionContext,
        resource: ResourceType,
        resource_id: &str,
        operation: &str,
        parameters: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> PolicyDecision {
        let start = Instant::now();
        let doc = self.snapshot();
        let decision = self.decide(&doc, ctx, resource, resource_id, parameters);
        self.audit.append(AuditEntry {
            transaction_id: ctx.transaction_id,
            timestamp: Utc::now(),
            subject: ctx.user_id.clone(),
            role: ctx.role.clone(),
            resource_type: resource.to_string(),
            resource_id: resource_id.to_string(),
            operation: operation.to_string(),
            decision: match decision.subcode {
                Some(subcode) => format!("deny:{}", subcode.as_str()),
                None => "allow".to_string(),
            },
            latency_ms: start.elapsed().as_millis() as u64,
        });
        if !decision.allowed {
            warn!(
                transaction_id = %ctx.transaction_id,
                resource = %format!("{resource}:{resource_id}"),
                reason = %decision.reason,
                "policy denied"
            );
        }
        decision
    }

    fn decide(
        &self,
        doc: &PolicyDocument,
        ctx: &TransactionContext,
        resource: ResourceType,
        resource_id: &str,
        parameters: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> PolicyDecision {
        let rules = doc.role(&ctx.role);

        // Deny overrides allow; the most specific rule wins.
        if rules.is_some_and(|r| r.denies(resource, resource_id)) {
            return PolicyDecision::deny(
                DenySubcode::ExplicitDeny,
                format!("{resource} '{resource_id}' is deny-listed for role '{}'", ctx.role),
            );
        }
        let allowed_by_role = rules.is_some_and(|r| r.allows(resource, resource_id));
        if !allowed_by_role && !doc.default_allows() {
            return PolicyDecision::deny(
                DenySubcode::DefaultDeny,
                format!(
                    "{resource} '{resource_id}' is not allow-listed for role '{}'",
                    ctx.role
                ),
            );
        }

        let restrictions = doc.restrictions_for(resource, resource_id);

        if let (Some(params), Some(restr)) = (parameters, restrictions) {
            if let Some(allowed) = &restr.allowed_parameters {
                let unconstrained = allowed.iter().any(|p| p == "*");
                if !unconstrained {
                    if let Some(bad) = params.keys().find(|k| !allowed.contains(k)) {
                        return PolicyDecision::deny(
                            DenySubcode::ParameterForbidden,
                            format!("parameter '{bad}' is not in the allow-list"),
                        );
                    }
                }
            }
            if let Some(bad) = params
                .keys()
                .find(|k| restr.forbidden_parameters.contains(k))
            {
                return PolicyDecision::deny(
                    DenySubcode::ParameterForbidden,
                    format!("parameter '{bad}' is forbidden"),
                );
            }
        }

        // Atomic check-and-increment across every applicable counter; the
        // increments commit only when all pass.
        let mut checks: Vec<(RateKey, u32)> = Vec::new();
        if let Some(limit) = doc.rate_limits.global_per_hour {
            checks.push((RateKey::global(), limit));
        }
        if let Some(limit) = doc.rate_limits.per_user_per_hour {
            let subject = ctx.user_id.clone().unwrap_or_else(|| "anonymous".into());
            checks.push((RateKey::user(subject), limit));
        }
        if let Some(limit) = restrictions.and_then(|r| r.rate_limit_per_hour) {
            checks.push((RateKey::resource(format!("{resource}:{resource_id}")), limit));
        }
        if let Err(exceeded) = self.rates.check_and_increment(&checks) {
            return PolicyDecision::deny(
                DenySubcode::RateLimited,
                format!(
                    "rate limit exceeded for {} '{}'",
                    exceeded.scope, exceeded.subject
                ),
            );
        }

        let applied = AppliedRestrictions {
            max_execution_time_seconds: restrictions.and_then(|r| r.max_execution_time),
        };
        let reason = if allowed_by_role {
            format!("allow-listed for role '{}'", ctx.role)
        } else {
            "allowed by default policy".to_string()
        };
        PolicyDecision::allow(reason, applied)
    }
}
