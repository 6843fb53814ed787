use {
    crate::{
        domain::{
            audit::NewAuditEntry,
            clock::Clock,
            error::PipelineError,
            id::{ExternalReference, ProviderPaymentId},
            money::{Money, MoneyAmount},
            payment::{NewPaymentRecord, Payer, PaymentMethod, PaymentRecord, PaymentStatus},
            provider::{CreatePaymentRequest, PaymentProvider, ProviderArtifacts},
            store::PaymentStore,
        },
        services::reconcile::Reconciler,
    },
    std::sync::Arc,
    uuid::Uuid,
};

/// A purchase request as it arrives from the client. Every field is
/// required; `amount` is a decimal string such as `"149.90"`.
#[derive(Debug, Clone)]
pub struct PaymentIntentInput {
    pub course_id: String,
    pub course_name: String,
    pub amount: String,
    pub method: String,
    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
}

/// Operator-granted free access to a course.
#[derive(Debug, Clone)]
pub struct AdminGrantInput {
    pub user_id: String,
    pub user_email: String,
    pub user_name: String,
    pub course_id: String,
    pub course_name: String,
}

/// The stored record plus what the client needs to finish paying.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub record: PaymentRecord,
    pub artifacts: ProviderArtifacts,
}

struct ValidIntent {
    course_id: String,
    course_name: String,
    money: Money,
    method: PaymentMethod,
    user_id: String,
    payer: Payer,
}

pub struct PaymentIntentService {
    provider: Arc<dyn PaymentProvider>,
    store: Arc<dyn PaymentStore>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
}

impl PaymentIntentService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: Arc<dyn PaymentStore>,
        reconciler: Arc<Reconciler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            reconciler,
            clock,
        }
    }

    /// Create the remote payment first; a local `pending` record exists only
    /// once the provider has accepted it.
    #[tracing::instrument(
        name = "create_payment",
        skip_all,
        fields(course_id = %input.course_id, method = %input.method, record_id)
    )]
    pub async fn create(&self, input: PaymentIntentInput) -> Result<PaymentIntent, PipelineError> {
        let intent = validate(input)?;
        let record_id = Uuid::now_v7();
        tracing::Span::current().record("record_id", tracing::field::display(record_id));

        let request = CreatePaymentRequest {
            record_id,
            method: intent.method,
            course_id: intent.course_id.clone(),
            course_name: intent.course_name.clone(),
            money: intent.money.clone(),
            payer: intent.payer.clone(),
            external_reference: ExternalReference::new(&intent.user_id, &intent.course_id),
        };
        let created = self.provider.create_payment(&request).await?;

        if created.provider_payment_id.is_none() && created.checkout_id.is_none() {
            return Err(PipelineError::Provider(
                "create response carried neither a payment id nor a checkout id".into(),
            ));
        }

        let record = PaymentRecord::pending(NewPaymentRecord {
            id: record_id,
            provider_payment_id: created.provider_payment_id.clone(),
            checkout_id: created.checkout_id.clone(),
            user_id: intent.user_id,
            course_id: intent.course_id,
            course_name: intent.course_name,
            payer: intent.payer,
            money: intent.money,
            method: intent.method,
            created_at: self.clock.now(),
        });
        self.store.insert(&record).await?;
        self.audit_created(&record, "client").await;

        tracing::info!(
            provider_payment_id = ?record.provider_payment_id().map(|id| id.as_str()),
            checkout_id = ?record.checkout_id(),
            "payment intent created"
        );

        let record = match (&created.provider_payment_id, created.status) {
            (Some(id), status) if status != PaymentStatus::Pending => {
                self.settle_on_create(record, id, status).await
            }
            _ => record,
        };

        Ok(PaymentIntent {
            record,
            artifacts: created.artifacts,
        })
    }

    /// The provider sometimes decides at creation time. That decision goes
    /// through the reconciler like any other observation; if it fails the
    /// pending record stands and the webhook or a poll finishes the job.
    async fn settle_on_create(
        &self,
        record: PaymentRecord,
        id: &ProviderPaymentId,
        status: PaymentStatus,
    ) -> PaymentRecord {
        match self.reconciler.reconcile(id, status, "provider:create").await {
            Ok(outcome) => outcome.record().cloned().unwrap_or(record),
            Err(e) => {
                tracing::warn!(provider_payment_id = %id, error = %e, "reconcile at creation failed, left pending");
                record
            }
        }
    }

    /// Create an `admin` record and reconcile it straight to `approved`. The
    /// provider is never contacted.
    #[tracing::instrument(
        name = "admin_grant",
        skip_all,
        fields(user_id = %input.user_id, course_id = %input.course_id)
    )]
    pub async fn grant_admin_access(
        &self,
        input: AdminGrantInput,
    ) -> Result<PaymentRecord, PipelineError> {
        require("userId", &input.user_id)?;
        require("userEmail", &input.user_email)?;
        require("userName", &input.user_name)?;
        require("courseId", &input.course_id)?;
        require("courseName", &input.course_name)?;
        validate_email(&input.user_email)?;

        let record_id = Uuid::now_v7();
        let provider_payment_id = ProviderPaymentId::admin(record_id);
        let record = PaymentRecord::pending(NewPaymentRecord {
            id: record_id,
            provider_payment_id: Some(provider_payment_id.clone()),
            checkout_id: None,
            user_id: input.user_id.trim().to_string(),
            course_id: input.course_id.trim().to_string(),
            course_name: input.course_name.trim().to_string(),
            payer: Payer::from_full_name(input.user_email.trim(), &input.user_name),
            money: Money::brl(MoneyAmount::ZERO),
            method: PaymentMethod::Admin,
            created_at: self.clock.now(),
        });
        self.store.insert(&record).await?;
        self.audit_created(&record, "admin").await;

        self.reconciler
            .reconcile(&provider_payment_id, PaymentStatus::Approved, "admin")
            .await?
            .into_record(&provider_payment_id)
    }

    async fn audit_created(&self, record: &PaymentRecord, actor: &str) {
        let entry = NewAuditEntry::new(
            Some(record.id()),
            record.provider_payment_id(),
            "created",
            actor,
            serde_json::json!({
                "method": record.method().as_str(),
                "amount": record.money().amount().to_string(),
                "currency": record.money().currency().as_str(),
                "checkout_id": record.checkout_id(),
                "external_reference": record.external_reference().as_str(),
            }),
            self.clock.now(),
        );
        if let Err(e) = self.store.append_audit(&entry).await {
            tracing::error!(record_id = %record.id(), error = %e, "failed to write audit entry");
        }
    }
}

fn validate(input: PaymentIntentInput) -> Result<ValidIntent, PipelineError> {
    require("courseId", &input.course_id)?;
    require("courseName", &input.course_name)?;
    require("amount", &input.amount)?;
    require("method", &input.method)?;
    require("userId", &input.user_id)?;
    require("userEmail", &input.user_email)?;
    require("userName", &input.user_name)?;
    validate_email(&input.user_email)?;

    let method = PaymentMethod::try_from(input.method.trim())?;
    if method == PaymentMethod::Admin {
        return Err(PipelineError::Validation(
            "method must be pix or card".into(),
        ));
    }

    let amount = MoneyAmount::parse_decimal(&input.amount)?;
    if amount.is_zero() {
        return Err(PipelineError::Validation("amount must be positive".into()));
    }

    Ok(ValidIntent {
        course_id: input.course_id.trim().to_string(),
        course_name: input.course_name.trim().to_string(),
        money: Money::brl(amount),
        method,
        user_id: input.user_id.trim().to_string(),
        payer: Payer::from_full_name(input.user_email.trim(), &input.user_name),
    })
}

fn require(field: &str, value: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), PipelineError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace) =>
        {
            Ok(())
        }
        _ => Err(PipelineError::Validation(format!(
            "userEmail is not an email address: {email}"
        ))),
    }
}
