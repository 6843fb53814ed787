use {crate::domain::audit::NewAuditEntry, crate::domain::error::PipelineError, sqlx::PgExecutor};

pub async fn insert_audit_entry<'e>(
    exec: impl PgExecutor<'e>,
    entry: &NewAuditEntry,
) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (id, entity_id, provider_payment_id, action, actor, detail, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id)
    .bind(entry.entity_id)
    .bind(entry.provider_payment_id.as_deref())
    .bind(&entry.action)
    .bind(&entry.actor)
    .bind(&entry.detail)
    .bind(entry.created_at)
    .execute(exec)
    .await?;

    Ok(())
}
