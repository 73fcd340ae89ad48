//! Ordered constraint dispatch (spec §4.6): stateless constraints are
//! checked before stateful ones, so a request that will fail anyway never
//! spuriously consumes a rate-limit token.

use super::rate_limiter::RateLimiter;
use crate::capability::model::{Capability, ConstraintValue, Constraints};
use crate::error::{ConstraintError, ConstraintKind};
use chrono::{Timelike, Utc};
use std::collections::HashMap;

fn time_window_ok(start_hour: u32, end_hour: u32) -> bool {
    let hour = Utc::now().hour();
    if start_hour <= end_hour {
        hour >= start_hour && hour < end_hour
    } else {
        hour >= start_hour || hour < end_hour
    }
}

/// Evaluate `constraints` in the fixed order `time_window` → `allowed_paths`
/// → `rate_limit` → `requires_approval`. The first violated constraint
/// short-circuits the rest.
pub fn enforce(
    constraints: &Constraints,
    principal_id: &str,
    resource_uri: &str,
    rate_limiter: &RateLimiter,
) -> Result<(), ConstraintError> {
    if let Some(ConstraintValue::TimeWindow { start_hour, end_hour }) = constraints.get("time_window") {
        if !time_window_ok(*start_hour, *end_hour) {
            return Err(ConstraintError {
                kind: ConstraintKind::TimeWindow,
                ctx: HashMap::new(),
            });
        }
    }

    if let Some(ConstraintValue::AllowedPaths { paths }) = constraints.get("allowed_paths") {
        let allowed = paths
            .iter()
            .any(|path| Capability::new(path.clone(), principal_id.to_string()).authorizes_resource(resource_uri));
        if !allowed {
            return Err(ConstraintError {
                kind: ConstraintKind::AllowedPaths,
                ctx: HashMap::new(),
            });
        }
    }

    if let Some(ConstraintValue::RateLimit { max_tokens }) = constraints.get("rate_limit") {
        rate_limiter.consume(principal_id, resource_uri, *max_tokens)?;
    }

    // requires_approval is always satisfied here; real enforcement happens
    // in the policy guard (spec §4.8).
    Ok(())
}
