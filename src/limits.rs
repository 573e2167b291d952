use sqlx::PgPool;
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};
use crate::model::CustomPlan;

/// Evaluates whether a company may take on another active user under its plan.
///
/// The decision itself is pure: callers load the plan and the current active
/// head count, the policy only applies the rule. Owners are always counted
/// toward the limit, in every flow.
pub struct LimitPolicy;

impl LimitPolicy {
    /// Ok iff the plan is active and there is room for one more active user.
    pub fn check(plan: &CustomPlan, active_user_count: i64) -> ServiceResult<()> {
        if !plan.is_active {
            return Err(ServiceError::Conflict("Company plan is inactive.".to_string()));
        }

        if active_user_count >= plan.user_limit as i64 {
            return Err(ServiceError::Conflict(format!(
                "User limit exceeded. Current: {}, Limit: {}.",
                active_user_count, plan.user_limit
            )));
        }

        debug!(
            company_id = plan.company_id,
            active_user_count,
            user_limit = plan.user_limit,
            "User limit check passed"
        );
        Ok(())
    }

    /// Load the plan and active head count for a company and apply the rule.
    /// `bypass_limit` skips the head-count check (developer-created users) but
    /// never the plan-active check.
    pub async fn check_company(
        pool: &PgPool,
        company_id: i32,
        bypass_limit: bool,
    ) -> ServiceResult<()> {
        let plan = Self::load_plan(pool, company_id).await?;

        if bypass_limit {
            if !plan.is_active {
                return Err(ServiceError::Conflict("Company plan is inactive.".to_string()));
            }
            return Ok(());
        }

        let active = Self::count_active_users(pool, company_id).await?;
        Self::check(&plan, active)
    }

    pub async fn load_plan(pool: &PgPool, company_id: i32) -> ServiceResult<CustomPlan> {
        sqlx::query_as::<_, CustomPlan>(
            "SELECT * FROM custom_plan WHERE company_id = $1",
        )
        .bind(company_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ServiceError::not_found("Company plan"))
    }

    pub async fn count_active_users(pool: &PgPool, company_id: i32) -> ServiceResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tax_user WHERE company_id = $1 AND is_active = TRUE",
        )
        .bind(company_id)
        .fetch_one(pool)
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn plan(user_limit: i32, is_active: bool) -> CustomPlan {
        let now = OffsetDateTime::now_utc();
        CustomPlan {
            plan_id: 1,
            company_id: 1,
            user_limit,
            is_active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_inactive_plan_blocks_additions() {
        let err = LimitPolicy::check(&plan(10, false), 0).unwrap_err();
        assert_eq!(err.to_string(), "Company plan is inactive.");
    }

    #[test]
    fn test_limit_exceeded_message() {
        let err = LimitPolicy::check(&plan(5, true), 5).unwrap_err();
        assert_eq!(err.to_string(), "User limit exceeded. Current: 5, Limit: 5.");
    }

    #[test]
    fn test_one_below_limit_is_allowed() {
        assert!(LimitPolicy::check(&plan(5, true), 4).is_ok());
    }

    #[test]
    fn test_over_limit_is_blocked() {
        // Head count can drift past the limit when the plan is downgraded
        let err = LimitPolicy::check(&plan(3, true), 7).unwrap_err();
        assert_eq!(err.to_string(), "User limit exceeded. Current: 7, Limit: 3.");
        assert!(err.is_business_rule());
    }
}
