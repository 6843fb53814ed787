use {
    crate::domain::{
        BoxFuture,
        dispatch::{EntitlementGrant, EntitlementGranter},
        error::PipelineError,
        payment::SideEffect,
    },
    sqlx::PgPool,
};

/// Course access as rows of `course_enrollments`; granting twice is a no-op.
#[derive(Clone)]
pub struct PgEntitlements {
    pool: PgPool,
}

impl PgEntitlements {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl EntitlementGranter for PgEntitlements {
    fn grant(&self, grant: EntitlementGrant) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO course_enrollments (user_id, course_id) VALUES ($1, $2) \
                 ON CONFLICT (user_id, course_id) DO NOTHING",
            )
            .bind(&grant.user_id)
            .bind(&grant.course_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Dispatcher {
                effect: SideEffect::Entitlement,
                message: e.to_string(),
            })?;
            Ok(())
        })
    }
}

pub async fn is_enrolled(pool: &PgPool, user_id: &str, course_id: &str) -> Result<bool, PipelineError> {
    let found: Option<i32> = sqlx::query_scalar(
        "SELECT 1 FROM course_enrollments WHERE user_id = $1 AND course_id = $2",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}
