//! GridCell - Multi-Tenant Microgrid Control Plane
//! Mission: Ingest, aggregate, price, and settle site telemetry on a
//! replayable event backbone

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridcell_backend::alarms::evaluator::AlarmEvaluator;
use gridcell_backend::alarms::notifier::{LogNotifier, NotifierConsumer, NotifyGate, SseBroker};
use gridcell_backend::alarms::store::{AlarmPendingStore, AlarmRuleStore, AlarmStore};
use gridcell_backend::api::{build_router, AppState};
use gridcell_backend::audit::AuditLog;
use gridcell_backend::auth::JwtHandler;
use gridcell_backend::clock::SystemClock;
use gridcell_backend::commands::consumer::CommandDispatchConsumer;
use gridcell_backend::commands::gateway::HttpDeviceGateway;
use gridcell_backend::commands::service::{CommandService, TimeoutSweeper};
use gridcell_backend::commands::store::CommandStore;
use gridcell_backend::config::Config;
use gridcell_backend::db::open_db;
use gridcell_backend::events::bus::{InProcessBus, Subscriber};
use gridcell_backend::events::dispatcher::{wrap_handler, Dispatcher};
use gridcell_backend::events::envelope::EventPayloadKind;
use gridcell_backend::events::outbox::OutboxStore;
use gridcell_backend::events::payloads::{
    AlarmStateChanged, CommandIssued, StatisticCalculated, TelemetryReceived,
    TelemetryWindowClosed,
};
use gridcell_backend::events::processed::{DeadLetterStore, ProcessedStore};
use gridcell_backend::events::registry::EventRegistry;
use gridcell_backend::metrics::MetricsRegistry;
use gridcell_backend::scheduler;
use gridcell_backend::settlement::service::SettlementService;
use gridcell_backend::settlement::store::{SettlementStore, TariffStore};
use gridcell_backend::statements::render::PlainReportRenderer;
use gridcell_backend::statements::service::StatementService;
use gridcell_backend::statements::store::StatementStore;
use gridcell_backend::stats::hourly::HourlyStatService;
use gridcell_backend::stats::rollup::RollupService;
use gridcell_backend::stats::store::StatisticStore;
use gridcell_backend::stats::timekey::Granularity;
use gridcell_backend::strategy::engine::StrategyEngine;
use gridcell_backend::strategy::store::StrategyStore;
use gridcell_backend::telemetry::ingest::IngestService;
use gridcell_backend::telemetry::store::{MeasurementStore, PointMappingStore};
use gridcell_backend::telemetry::window::WindowCloser;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let config = Config::from_env();
    info!(db = config.db_path, bind = config.bind_addr, "🔌 GridCell backend starting");

    let db = open_db(&config.db_path)?;
    let clock = Arc::new(SystemClock);
    let metrics = Arc::new(MetricsRegistry::new());

    // Stores; each ensures its own schema.
    let outbox = OutboxStore::new(db.clone())?;
    let processed = ProcessedStore::new(db.clone())?;
    let dlq = DeadLetterStore::new(db.clone())?;
    let measurements = MeasurementStore::new(db.clone())?;
    let mappings = PointMappingStore::new(db.clone())?;
    let stats = StatisticStore::new(db.clone())?;
    let alarm_rules = AlarmRuleStore::new(db.clone())?;
    let alarm_pending = AlarmPendingStore::new(db.clone())?;
    let alarm_store = AlarmStore::new(db.clone())?;
    let command_store = CommandStore::new(db.clone())?;
    let tariffs = TariffStore::new(db.clone())?;
    let settlements = SettlementStore::new(db.clone())?;
    let statement_store = StatementStore::new(db.clone())?;
    let strategies = StrategyStore::new(db.clone())?;
    let audit = AuditLog::new(db.clone())?;

    // Services.
    let ingest = Arc::new(IngestService::new(db.clone(), metrics.clone(), clock.clone()));
    let window_closer = Arc::new(WindowCloser::new(outbox.clone(), clock.clone()));
    let hourly = Arc::new(HourlyStatService::new(
        db.clone(),
        measurements.clone(),
        mappings.clone(),
        stats.clone(),
        clock.clone(),
    ));
    let rollup_day = Arc::new(
        RollupService::new(Granularity::Day, db.clone(), stats.clone(), clock.clone())
            .with_expected_children(config.expected_hours),
    );
    let rollup_month = Arc::new(RollupService::new(
        Granularity::Month,
        db.clone(),
        stats.clone(),
        clock.clone(),
    ));
    let rollup_year = Arc::new(RollupService::new(
        Granularity::Year,
        db.clone(),
        stats.clone(),
        clock.clone(),
    ));
    let evaluator = Arc::new(AlarmEvaluator::new(
        db.clone(),
        alarm_rules.clone(),
        alarm_pending,
        alarm_store.clone(),
        mappings.clone(),
        clock.clone(),
    ));
    let command_service = Arc::new(CommandService::new(
        db.clone(),
        command_store.clone(),
        metrics.clone(),
        clock.clone(),
        chrono::Duration::seconds(config.command_ttl_secs),
    ));
    let gateway = Arc::new(HttpDeviceGateway::new(
        config.device_gateway_url.clone(),
        Duration::from_secs(10),
    )?);
    let command_consumer = Arc::new(CommandDispatchConsumer::new(
        db.clone(),
        command_store.clone(),
        gateway,
        metrics.clone(),
        clock.clone(),
    ));
    let settlement_service = Arc::new(SettlementService::new(
        db.clone(),
        stats.clone(),
        tariffs.clone(),
        settlements.clone(),
        clock.clone(),
    ));
    let statement_service = Arc::new(StatementService::new(
        db.clone(),
        statement_store,
        settlements.clone(),
        Arc::new(PlainReportRenderer),
        audit.clone(),
        clock.clone(),
        config.default_currency.clone(),
    ));
    let broker = Arc::new(SseBroker::new());
    let notifier_consumer = Arc::new(NotifierConsumer::new(
        Arc::new(LogNotifier),
        NotifyGate::new(chrono::Duration::minutes(5), chrono::Duration::minutes(10)),
        broker.clone(),
        clock.clone(),
    ));
    let strategy_engine = Arc::new(StrategyEngine::new(
        strategies.clone(),
        mappings.clone(),
        measurements.clone(),
        command_service.clone(),
        clock.clone(),
    ));
    let sweeper = Arc::new(TimeoutSweeper::new(
        command_store.clone(),
        metrics.clone(),
        clock.clone(),
        chrono::Duration::seconds(config.command_timeout_secs),
    ));

    // Bus wiring: every consumer is wrapped for per-consumer idempotency.
    let bus = Arc::new(InProcessBus::new());
    bus.subscribe(
        TelemetryWindowClosed::TYPE_NAME,
        wrap_handler("stat_hourly", hourly, processed.clone(), metrics.clone(), clock.clone()),
    );
    bus.subscribe(
        StatisticCalculated::TYPE_NAME,
        wrap_handler("rollup_day", rollup_day, processed.clone(), metrics.clone(), clock.clone()),
    );
    bus.subscribe(
        StatisticCalculated::TYPE_NAME,
        wrap_handler("rollup_month", rollup_month, processed.clone(), metrics.clone(), clock.clone()),
    );
    bus.subscribe(
        StatisticCalculated::TYPE_NAME,
        wrap_handler("rollup_year", rollup_year, processed.clone(), metrics.clone(), clock.clone()),
    );
    bus.subscribe(
        StatisticCalculated::TYPE_NAME,
        wrap_handler(
            "settlement_daily",
            settlement_service,
            processed.clone(),
            metrics.clone(),
            clock.clone(),
        ),
    );
    bus.subscribe(
        TelemetryReceived::TYPE_NAME,
        wrap_handler(
            "alarm_evaluator",
            evaluator.clone(),
            processed.clone(),
            metrics.clone(),
            clock.clone(),
        ),
    );
    bus.subscribe(
        CommandIssued::TYPE_NAME,
        wrap_handler(
            "command_dispatch",
            command_consumer,
            processed.clone(),
            metrics.clone(),
            clock.clone(),
        ),
    );
    bus.subscribe(
        AlarmStateChanged::TYPE_NAME,
        wrap_handler(
            "alarm_notifier",
            notifier_consumer,
            processed,
            metrics.clone(),
            clock.clone(),
        ),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        outbox,
        dlq,
        Arc::new(EventRegistry::with_core_types()),
        bus,
        metrics.clone(),
        clock.clone(),
        config.dispatch_max_attempts,
    ));

    // Background ticks.
    let _dispatch_loop = scheduler::spawn_dispatcher_loop(
        dispatcher,
        config.dispatch_interval_ms,
        config.dispatch_batch,
    );
    let _strategy_loop = scheduler::spawn_strategy_loop(strategy_engine, config.strategy_interval_secs);
    let _sweep_loop = scheduler::spawn_timeout_sweep_loop(sweeper, config.timeout_sweep_interval_secs);
    info!("⚙️ Background loops started (dispatch, strategy, timeout sweep)");

    // HTTP surface.
    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let state = AppState {
        ingest,
        window_closer,
        stats,
        settlements,
        tariffs,
        command_service,
        command_store,
        alarm_store,
        alarm_rules,
        evaluator,
        statements: statement_service,
        strategies,
        mappings,
        measurements,
        broker,
        metrics,
        audit,
        clock,
        ingest_hmac_secret: config.ingest_hmac_secret.clone(),
        ingest_skew_secs: config.ingest_skew_secs,
    };
    let app = build_router(state, jwt);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!("🚀 GridCell backend listening on {}", config.bind_addr);
    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}

/// Initialize tracing with env-filter control.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridcell_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
