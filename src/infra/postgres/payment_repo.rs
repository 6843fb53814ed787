use {
    super::audit_repo::insert_audit_entry,
    crate::domain::{
        BoxFuture,
        audit::NewAuditEntry,
        error::PipelineError,
        id::{ExternalReference, ProviderPaymentId},
        money::{Currency, Money, MoneyAmount},
        payment::{
            Payer, PaymentMethod, PaymentRecord, PaymentRecordParts, PaymentStatus, SideEffect,
            SideEffects,
        },
        store::{PaymentStore, RecordLock, UnsettledQuery},
    },
    chrono::{DateTime, Utc},
    sqlx::{PgExecutor, PgPool, Postgres, pool::PoolConnection},
    std::time::Duration,
    uuid::Uuid,
};

const COLUMNS: &str = "id, provider_payment_id, checkout_id, external_reference, user_id, \
    course_id, course_name, payer_email, payer_first_name, payer_last_name, amount, currency, \
    method, status, side_effects, created_at, approved_at";

/// Postgres `lock_not_available`, raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    provider_payment_id: Option<String>,
    checkout_id: Option<String>,
    external_reference: String,
    user_id: String,
    course_id: String,
    course_name: String,
    payer_email: String,
    payer_first_name: String,
    payer_last_name: String,
    amount: i64,
    currency: String,
    method: String,
    status: String,
    side_effects: Vec<String>,
    created_at: DateTime<Utc>,
    approved_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = PipelineError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(PaymentRecord::from_parts(PaymentRecordParts {
            id: row.id,
            provider_payment_id: row
                .provider_payment_id
                .map(ProviderPaymentId::new)
                .transpose()?,
            checkout_id: row.checkout_id,
            external_reference: ExternalReference::from_stored(row.external_reference),
            user_id: row.user_id,
            course_id: row.course_id,
            course_name: row.course_name,
            payer: Payer {
                email: row.payer_email,
                first_name: row.payer_first_name,
                last_name: row.payer_last_name,
            },
            money: Money::new(
                MoneyAmount::new(row.amount)?,
                Currency::try_from(row.currency.as_str())?,
            ),
            method: PaymentMethod::try_from(row.method.as_str())?,
            status: PaymentStatus::try_from(row.status.as_str())?,
            side_effects_applied: SideEffects::try_from(row.side_effects)?,
            created_at: row.created_at,
            approved_at: row.approved_at,
        }))
    }
}

fn unique_violation_as_conflict(err: sqlx::Error, what: String) -> PipelineError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => PipelineError::Conflict(what),
        _ => PipelineError::Database(err),
    }
}

async fn fetch_by_provider_id<'e>(
    exec: impl PgExecutor<'e>,
    id: &ProviderPaymentId,
) -> Result<Option<PaymentRecord>, PipelineError> {
    let row: Option<PaymentRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM payments WHERE provider_payment_id = $1"
    ))
    .bind(id.as_str())
    .fetch_optional(exec)
    .await?;

    row.map(PaymentRecord::try_from).transpose()
}

async fn insert_payment(pool: &PgPool, record: &PaymentRecord) -> Result<(), PipelineError> {
    sqlx::query(&format!(
        "INSERT INTO payments ({COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
    ))
    .bind(record.id())
    .bind(record.provider_payment_id().map(|id| id.as_str()))
    .bind(record.checkout_id())
    .bind(record.external_reference().as_str())
    .bind(record.user_id())
    .bind(record.course_id())
    .bind(record.course_name())
    .bind(&record.payer().email)
    .bind(&record.payer().first_name)
    .bind(&record.payer().last_name)
    .bind(record.money().amount().cents())
    .bind(record.money().currency().as_str())
    .bind(record.method().as_str())
    .bind(record.status().as_str())
    .bind(record.side_effects_applied().to_strings())
    .bind(record.created_at())
    .bind(record.approved_at())
    .execute(pool)
    .await
    .map_err(|e| {
        unique_violation_as_conflict(
            e,
            format!(
                "payment {} or its provider payment id already recorded",
                record.id()
            ),
        )
    })?;

    Ok(())
}

/// Payment records in Postgres. Per-record exclusion is a session-level
/// advisory lock on `hashtext(provider_payment_id)`.
#[derive(Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn acquire_lock(&self, id: &ProviderPaymentId) -> Result<PgRecordLock, PipelineError> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query("SELECT set_config('lock_timeout', $1, false)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *conn)
            .await?;

        let locked = sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
            .bind(id.as_str())
            .execute(&mut *conn)
            .await;

        let reset = sqlx::query("RESET lock_timeout").execute(&mut *conn).await;
        if let Err(e) = reset {
            // Never hand a connection back to the pool that may still hold
            // the lock or a modified lock_timeout.
            drop(conn.detach());
            return Err(e.into());
        }

        match locked {
            Ok(_) => Ok(PgRecordLock {
                conn: Some(conn),
                key: id.clone(),
            }),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                Err(PipelineError::Timeout(format!(
                    "waiting for record lock on {id}"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl PaymentStore for PgPaymentStore {
    fn insert<'a>(&'a self, record: &'a PaymentRecord) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(insert_payment(&self.pool, record))
    }

    fn find_by_provider_id<'a>(
        &'a self,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<Option<PaymentRecord>, PipelineError>> {
        Box::pin(fetch_by_provider_id(&self.pool, id))
    }

    fn find_by_id(&self, id: Uuid) -> BoxFuture<'_, Result<Option<PaymentRecord>, PipelineError>> {
        Box::pin(async move {
            let row: Option<PaymentRow> =
                sqlx::query_as(&format!("SELECT {COLUMNS} FROM payments WHERE id = $1"))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(PaymentRecord::try_from).transpose()
        })
    }

    fn list_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, Result<Vec<PaymentRecord>, PipelineError>> {
        Box::pin(async move {
            let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM payments \
                 WHERE lower(payer_email) = lower($1) \
                 ORDER BY created_at DESC"
            ))
            .bind(email.trim())
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(PaymentRecord::try_from).collect()
        })
    }

    fn list_unsettled(
        &self,
        query: UnsettledQuery,
    ) -> BoxFuture<'_, Result<Vec<PaymentRecord>, PipelineError>> {
        Box::pin(async move {
            let all_effects: Vec<&str> = SideEffect::ALL.iter().map(|e| e.as_str()).collect();
            // Each class gets its own share of the batch so approvals that
            // keep failing cannot crowd out pending records.
            let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
                "(SELECT {COLUMNS} FROM payments \
                  WHERE status = 'approved' AND NOT (side_effects @> $1) \
                  ORDER BY created_at \
                  LIMIT $4) \
                 UNION ALL \
                 (SELECT {COLUMNS} FROM payments \
                  WHERE status = 'pending' \
                    AND provider_payment_id IS NOT NULL \
                    AND method <> 'admin' \
                    AND created_at < $2 \
                    AND created_at > $3 \
                  ORDER BY created_at \
                  LIMIT $4)"
            ))
            .bind(all_effects)
            .bind(query.pending_created_before)
            .bind(query.pending_created_after)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(PaymentRecord::try_from).collect()
        })
    }

    fn attach_provider_id<'a>(
        &'a self,
        record_id: Uuid,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<bool, PipelineError>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE payments SET provider_payment_id = $2, updated_at = now() \
                 WHERE id = $1 AND provider_payment_id IS NULL",
            )
            .bind(record_id)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                unique_violation_as_conflict(
                    e,
                    format!("provider payment id {id} already bound to another record"),
                )
            })?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn lock<'a>(
        &'a self,
        id: &'a ProviderPaymentId,
    ) -> BoxFuture<'a, Result<Box<dyn RecordLock>, PipelineError>> {
        Box::pin(async move {
            let lock = self.acquire_lock(id).await?;
            Ok(Box::new(lock) as Box<dyn RecordLock>)
        })
    }

    fn append_audit<'a>(
        &'a self,
        entry: &'a NewAuditEntry,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(insert_audit_entry(&self.pool, entry))
    }
}

/// Holds the pooled connection that owns the advisory lock. If dropped
/// without `release`, the connection is detached and closed, which ends the
/// session and frees the lock server-side.
pub struct PgRecordLock {
    conn: Option<PoolConnection<Postgres>>,
    key: ProviderPaymentId,
}

impl PgRecordLock {
    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>, PipelineError> {
        self.conn
            .as_mut()
            .ok_or_else(|| PipelineError::Conflict(format!("lock on {} already released", self.key)))
    }
}

impl RecordLock for PgRecordLock {
    fn load(&mut self) -> BoxFuture<'_, Result<Option<PaymentRecord>, PipelineError>> {
        Box::pin(async move {
            let key = self.key.clone();
            let conn = self.conn()?;
            fetch_by_provider_id(&mut **conn, &key).await
        })
    }

    fn save_status(
        &mut self,
        record_id: Uuid,
        status: PaymentStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let result = sqlx::query(
                "UPDATE payments SET status = $2, approved_at = $3, updated_at = now() \
                 WHERE id = $1 AND status = 'pending'",
            )
            .bind(record_id)
            .bind(status.as_str())
            .bind(approved_at)
            .execute(&mut **conn)
            .await?;

            if result.rows_affected() == 0 {
                return Err(PipelineError::Conflict(format!(
                    "record {record_id} is no longer pending"
                )));
            }
            Ok(())
        })
    }

    fn add_side_effect(
        &mut self,
        record_id: Uuid,
        effect: SideEffect,
    ) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(async move {
            let conn = self.conn()?;
            sqlx::query(
                "UPDATE payments \
                 SET side_effects = array_append(side_effects, $2), updated_at = now() \
                 WHERE id = $1 AND NOT ($2 = ANY(side_effects))",
            )
            .bind(record_id)
            .bind(effect.as_str())
            .execute(&mut **conn)
            .await?;
            Ok(())
        })
    }

    fn release(mut self: Box<Self>) -> BoxFuture<'static, Result<(), PipelineError>> {
        Box::pin(async move {
            let Some(mut conn) = self.conn.take() else {
                return Ok(());
            };
            let unlocked = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(self.key.as_str())
                .execute(&mut *conn)
                .await;

            match unlocked {
                Ok(_) => Ok(()),
                Err(e) => {
                    drop(conn.detach());
                    Err(e.into())
                }
            }
        })
    }
}

impl Drop for PgRecordLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(provider_payment_id = %self.key, "record lock dropped without release, closing connection");
            drop(conn.detach());
        }
    }
}
