use {
    axum::extract::DefaultBodyLimit,
    course_pay::{
        AppState,
        adapters::{
            mailer::{HttpMailer, LogMailer},
            mercadopago::MercadoPagoClient,
        },
        config::AppConfig,
        domain::{
            clock::{Clock, SystemClock},
            dispatch::{ConfirmationMailer, Dispatchers, EntitlementGranter, InvoiceGenerator},
            store::PaymentStore,
        },
        infra::{
            memory::{MemoryEntitlements, MemoryInvoices, MemoryPaymentStore},
            postgres::{
                self, enrollment_repo::PgEntitlements, invoice_repo::PgInvoices,
                payment_repo::PgPaymentStore,
            },
        },
        services::{
            payment_intent::PaymentIntentService,
            reconcile::Reconciler,
            status_oracle::StatusOracle,
            sweeper::{Sweeper, run_sweeper},
            tasks::BackgroundTasks,
        },
        transport::http::router,
    },
    std::sync::Arc,
    tokio::{signal, sync::watch},
    tower_http::{timeout::TimeoutLayer, trace::TraceLayer},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env().expect("invalid configuration");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let lock_timeout = config.reconcile.lock_timeout;

    let (store, entitlements, invoices): (
        Arc<dyn PaymentStore>,
        Arc<dyn EntitlementGranter>,
        Arc<dyn InvoiceGenerator>,
    ) = match &config.database {
        Some(db) => {
            let pool = postgres::connect(&db.url, db.max_connections)
                .await
                .expect("failed to connect to database");
            postgres::migrate(&pool)
                .await
                .expect("failed to run migrations");
            tracing::info!("using postgres store");
            (
                Arc::new(PgPaymentStore::new(pool.clone(), lock_timeout)),
                Arc::new(PgEntitlements::new(pool.clone())),
                Arc::new(PgInvoices::new(pool)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store; data is lost on exit");
            (
                Arc::new(MemoryPaymentStore::new(lock_timeout)),
                Arc::new(MemoryEntitlements::default()),
                Arc::new(MemoryInvoices::default()),
            )
        }
    };

    let mailer: Arc<dyn ConfirmationMailer> = match &config.mailer {
        Some(mailer) => Arc::new(
            HttpMailer::new(mailer, config.reconcile.dispatch_timeout)
                .expect("failed to build mailer"),
        ),
        None => {
            tracing::warn!("MAILER_BASE_URL not set, confirmation emails are only logged");
            Arc::new(LogMailer)
        }
    };

    let dispatchers = Dispatchers {
        entitlements,
        invoices,
        mailer,
    };

    let provider = Arc::new(
        MercadoPagoClient::new(&config.provider).expect("failed to build provider client"),
    );

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        dispatchers,
        Arc::clone(&clock),
        config.reconcile.dispatch_timeout,
    ));
    let oracle = Arc::new(StatusOracle::new(
        provider.clone(),
        Arc::clone(&store),
        Arc::clone(&reconciler),
        Arc::clone(&clock),
        config.reconcile.status_cache_ttl,
    ));
    let intents = Arc::new(PaymentIntentService::new(
        provider,
        Arc::clone(&store),
        Arc::clone(&reconciler),
        Arc::clone(&clock),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = if config.sweeper.interval.is_zero() {
        tracing::info!("settlement sweeper disabled");
        None
    } else {
        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&store),
            Arc::clone(&oracle),
            Arc::clone(&reconciler),
            Arc::clone(&clock),
            config.sweeper.clone(),
        ));
        Some(tokio::spawn(run_sweeper(sweeper, shutdown_rx)))
    };

    if config.admin_token.is_none() {
        tracing::info!("ADMIN_TOKEN not set, admin routes disabled");
    }

    let tasks = Arc::new(BackgroundTasks::new());
    let state = AppState {
        intents,
        oracle,
        reconciler,
        store,
        admin_token: config.admin_token.as_deref().map(Arc::from),
        tasks: Arc::clone(&tasks),
    };

    let app = router(state)
        .layer(DefaultBodyLimit::max(config.server.body_limit_bytes))
        .layer(TimeoutLayer::new(config.server.request_timeout))
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listener");
    tracing::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Reconciles outlive the requests that started them; finish them first.
    tasks.drain().await;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl+c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
