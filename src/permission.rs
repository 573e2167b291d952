use sqlx::{Postgres, Transaction};
use tracing::{info, warn};

use crate::error::ServiceResult;

const INHERITANCE_NOTE: &str = "Inherited from administrator role at registration";

/// Copies the granted permissions of the company's administrator-category
/// roles, as held by its active owners, onto a newly registered user.
pub struct PermissionInheritance;

impl PermissionInheritance {
    /// Runs inside the registration transaction. Deduplicates by permission
    /// code; finding nothing to inherit is a warning, never a failure.
    pub async fn inherit(
        tx: &mut Transaction<'_, Postgres>,
        company_id: i32,
        new_user_id: i32,
    ) -> ServiceResult<u64> {
        let codes: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT p.code
             FROM permission p
             JOIN role_permission rp ON rp.permission_id = p.permission_id AND rp.is_granted = TRUE
             JOIN role r ON r.role_id = rp.role_id AND r.category = 'administrator'
             JOIN user_role ur ON ur.role_id = r.role_id
             JOIN tax_user u ON u.user_id = ur.user_id
             WHERE u.company_id = $1 AND u.is_active = TRUE AND u.is_owner = TRUE",
        )
        .bind(company_id)
        .fetch_all(&mut **tx)
        .await?;

        if codes.is_empty() {
            warn!(
                company_id,
                new_user_id, "No inheritable administrator permissions found"
            );
            return Ok(0);
        }

        let mut inherited = 0u64;
        for code in &codes {
            let result = sqlx::query(
                "INSERT INTO company_permission (user_id, permission_code, is_granted, description, created_at)
                 VALUES ($1, $2, TRUE, $3, NOW())
                 ON CONFLICT (user_id, permission_code) DO NOTHING",
            )
            .bind(new_user_id)
            .bind(code)
            .bind(INHERITANCE_NOTE)
            .execute(&mut **tx)
            .await?;

            inherited += result.rows_affected();
        }

        info!(
            company_id,
            new_user_id, inherited, "Administrator permissions inherited"
        );
        Ok(inherited)
    }
}
