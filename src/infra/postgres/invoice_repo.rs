use {
    crate::domain::{
        BoxFuture,
        dispatch::{InvoiceGenerator, InvoiceRequest},
        error::PipelineError,
        payment::SideEffect,
    },
    sqlx::PgPool,
    uuid::Uuid,
};

/// At most one invoice per payment, enforced by `invoices.payment_id UNIQUE`.
#[derive(Clone)]
pub struct PgInvoices {
    pool: PgPool,
}

impl PgInvoices {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn issue(&self, req: &InvoiceRequest) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::now_v7();
        let number = format!("INV-{}", id.simple()).to_uppercase();

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO invoices (id, payment_id, number, user_id, course_id, course_name, amount, currency)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (payment_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(req.payment_id)
        .bind(&number)
        .bind(&req.user_id)
        .bind(&req.course_id)
        .bind(&req.course_name)
        .bind(req.money.amount().cents())
        .bind(req.money.currency().as_str())
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(id) => Ok(id),
            None => {
                sqlx::query_scalar("SELECT id FROM invoices WHERE payment_id = $1")
                    .bind(req.payment_id)
                    .fetch_one(&self.pool)
                    .await
            }
        }
    }
}

impl InvoiceGenerator for PgInvoices {
    fn generate_invoice(&self, req: InvoiceRequest) -> BoxFuture<'_, Result<Uuid, PipelineError>> {
        Box::pin(async move {
            self.issue(&req)
                .await
                .map_err(|e| PipelineError::Dispatcher {
                    effect: SideEffect::Invoice,
                    message: e.to_string(),
                })
        })
    }
}
