//! herakles-vmware-exporter entry point.
//!
//! Resolves the configuration, dispatches subcommands, and in server mode
//! runs the collector in the background while axum serves the cache.

use axum::{routing::get, Router};
use clap::Parser;
use herakles_vmware_exporter::config::{
    load_config, validate_effective_config, Config, DEFAULT_BIND_ADDR, DEFAULT_PORT,
    DEFAULT_REFRESH_INTERVAL, DEFAULT_TAGS_REFRESH_INTERVAL,
};
use herakles_vmware_exporter::health_stats::HealthStats;
use herakles_vmware_exporter::Collector;
use prometheus::{Gauge, Registry};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::{
    net::TcpListener,
    signal,
    sync::RwLock,
    time::{interval, interval_at},
};
use tracing::{debug, error, info, level_filters::LevelFilter, warn};

mod cli;
mod commands;
mod handlers;
mod metrics;
mod runtime;
mod state;

use cli::{Args, Commands, ConfigFormat, LogLevel};
use commands::{command_check, command_config, command_generate_testdata, command_test};
use handlers::{
    counter_handler, doc_handler, dump_handler, entity_handler, entity_tags_handler,
    health_handler, inventory_handler, memory_handler, metrics_handler, object_handler,
    tags_handler,
};
use metrics::CacheMetrics;
use runtime::build_collector;
use state::{AppState, CycleState, SharedState};

type SharedCollector = Arc<Mutex<Collector>>;

/// Merges CLI overrides into the loaded configuration.
fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    // Override with CLI args
    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(cli_port) = args.port {
        config.port = Some(cli_port);
    }
    if let Some(level) = args.log_level {
        config.log_level = Some(format!("{:?}", level).to_lowercase());
    }

    // Cache and collector settings
    if let Some(size) = &args.cache_size {
        config.cache_size = Some(size.clone());
    }
    if args.refresh_interval.is_some() {
        config.refresh_interval = args.refresh_interval;
    }
    if args.tags_refresh_interval.is_some() {
        config.tags_refresh_interval = args.tags_refresh_interval;
    }
    if args.max_counters_per_request.is_some() {
        config.max_counters_per_request = args.max_counters_per_request;
    }
    if args.first_commit_retries.is_some() {
        config.first_commit_retries = args.first_commit_retries;
    }
    if args.parallelism.is_some() {
        config.parallelism = args.parallelism;
    }
    if let Some(path) = &args.test_data_file {
        config.test_data_file = Some(path.clone());
    }

    // Feature flags
    if args.disable_health {
        config.enable_health = Some(false);
    }
    if args.disable_telemetry {
        config.enable_telemetry = Some(false);
    }
    if args.disable_tags {
        config.enable_tags = Some(false);
    }

    Ok(config)
}

/// Shows configuration in requested format
fn show_config(config: &Config, format: ConfigFormat) -> Result<(), Box<dyn std::error::Error>> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };
    println!("{output}");
    Ok(())
}

fn setup_logging(config: &Config, args: &Args) {
    let level = args
        .log_level
        .or_else(|| config.log_level.as_deref().and_then(LogLevel::from_config))
        .unwrap_or(LogLevel::Info);

    let filter = match level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return;
    }

    info!("Logging initialized with level: {:?}", level);
}

/// Runs one performance cycle on the blocking pool and publishes its
/// outcome. Returns an error only when the exporter has to stop.
async fn update_cache(state: &SharedState, collector: &SharedCollector) -> Result<(), String> {
    let start = Instant::now();
    debug!("Starting performance cycle");

    {
        let mut cycle = state.cycle.write().await;
        cycle.is_updating = true;
    }

    let collector = collector.clone();
    let now = chrono::Utc::now().timestamp();
    let result = tokio::task::spawn_blocking(move || {
        let mut collector = collector.lock().unwrap_or_else(|e| e.into_inner());
        collector.run_cycle(now)
    })
    .await
    .map_err(|e| format!("collector task failed: {}", e))?;

    let mut cycle = state.cycle.write().await;
    cycle.is_updating = false;

    match result {
        Ok(report) => {
            cycle.update_success = report.error.is_none();
            cycle.last_updated = Some(start);

            match &report.error {
                None => {
                    let commit = report.commit.unwrap_or_default();
                    let memory = state.cache.memory_report();
                    state.health_stats.record_cycle(
                        memory.entities as u64,
                        commit.values as u64,
                        memory.status.last_required as u64,
                        report.duration_seconds,
                        report.skipped_commit,
                    );
                }
                Some(e) => {
                    warn!("Performance cycle failed: {}", e);
                    state.health_stats.record_failed_cycle();
                }
            }
            cycle.last_report = Some(report);
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            cycle.update_success = false;
            state.health_stats.record_failed_cycle();
            Err(e.to_string())
        }
        Err(e) => {
            error!("Performance cycle failed: {}", e);
            cycle.update_success = false;
            state.health_stats.record_failed_cycle();
            Ok(())
        }
    }
}

/// Runs one tag cycle on the blocking pool.
async fn update_tags(state: &SharedState, collector: &SharedCollector) {
    let start = Instant::now();
    let collector = collector.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut collector = collector.lock().unwrap_or_else(|e| e.into_inner());
        collector.run_tags_cycle()
    })
    .await;

    match result {
        Ok(Ok(report)) => {
            state
                .health_stats
                .record_tags_cycle(start.elapsed().as_secs_f64());
            if let Some(e) = &report.error {
                warn!("Tag cycle failed: {}", e);
            }
            state.cycle.write().await.last_tags = Some(report);
        }
        Ok(Err(e)) => error!("Tag cycle failed: {}", e),
        Err(e) => error!("Tag task failed: {}", e),
    }
}

/// -------------------------------------------------------------------
/// MAIN APPLICATION ENTRY POINT
/// -------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        return show_config(&config, args.config_format);
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        if let Commands::GenerateTestdata {
            output,
            hosts,
            vms_per_host,
            datastores,
        } = command
        {
            return command_generate_testdata(output.clone(), *hosts, *vms_per_host, *datastores);
        }
        if let Commands::Config {
            output,
            format,
            commented,
        } = command
        {
            return command_config(output.clone(), *format, *commented);
        }

        let config = resolve_config(&args)?;
        if let Err(e) = validate_effective_config(&config) {
            eprintln!("❌ Configuration invalid: {}", e);
            std::process::exit(1);
        }
        setup_logging(&config, &args);

        return match command {
            Commands::Check { cycle } => command_check(*cycle, &config),
            Commands::Test {
                iterations,
                verbose,
                format,
            } => command_test(*iterations, *verbose, *format, &config),
            Commands::Config { .. } | Commands::GenerateTestdata { .. } => Ok(()),
        };
    }

    // Load configuration for main server mode
    let config = resolve_config(&args)?;

    // Validate config before starting exporter
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    setup_logging(&config, &args);

    info!("Starting herakles-vmware-exporter");

    let bind_ip_str = config.bind.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
    let port = config.port.unwrap_or(DEFAULT_PORT);

    // Configure parallel processing thread pool if specified
    if let Some(threads) = config.parallelism {
        if threads > 0 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .unwrap_or_else(|e| error!("Failed to set rayon thread pool: {}", e));
            debug!("Rayon thread pool configured with {} threads", threads);
        }
    }

    let collector = build_collector(&config)?;
    let cache = collector.cache().clone();
    let collector: SharedCollector = Arc::new(Mutex::new(collector));

    // Initialize Prometheus metrics registry
    let registry = Registry::new();
    let metrics = CacheMetrics::new(&registry, config.enable_telemetry.unwrap_or(true))?;
    let scrape_duration = Gauge::new(
        "herakles_vmware_scrape_duration_seconds",
        "Time spent serving /metrics request (reading from cache)",
    )?;
    registry.register(Box::new(scrape_duration.clone()))?;
    debug!("All metrics registered successfully");

    let state = Arc::new(AppState {
        registry,
        metrics,
        scrape_duration,
        cache,
        cycle: RwLock::new(CycleState::default()),
        config: Arc::new(config.clone()),
        health_stats: Arc::new(HealthStats::new()),
    });

    // Perform the first cycle before starting the server
    info!("Performing initial performance cycle");
    if let Err(e) = update_cache(&state, &collector).await {
        error!("Initial performance cycle failed: {}", e);
        return Err(e.into());
    }

    let refresh = Duration::from_secs(config.refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL));
    let tags_refresh = Duration::from_secs(
        config
            .tags_refresh_interval
            .unwrap_or(DEFAULT_TAGS_REFRESH_INTERVAL),
    );
    let tags_enabled = config.enable_tags.unwrap_or(true);

    // Start background collector task
    let bg_state = state.clone();
    let mut background_task = tokio::spawn(async move {
        let mut perf = interval_at(tokio::time::Instant::now() + refresh, refresh);
        let mut tags = interval(tags_refresh);
        debug!(
            "Background collector started with {}s performance and {}s tag interval",
            refresh.as_secs(),
            tags_refresh.as_secs()
        );

        loop {
            tokio::select! {
                _ = perf.tick() => {
                    if let Err(e) = update_cache(&bg_state, &collector).await {
                        return Err::<(), String>(e);
                    }
                }
                _ = tags.tick(), if tags_enabled => {
                    update_tags(&bg_state, &collector).await;
                }
            }
        }
    });

    // Setup graceful shutdown signal handlers
    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install signal handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down gracefully...");
            }
        }
    };

    // Configure HTTP server routes and start listening
    let addr: SocketAddr = format!("{}:{}", bind_ip_str, port).parse()?;

    let mut app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/entity/{type}/{id}", get(entity_handler))
        .route("/counter", get(counter_handler))
        .route("/tags", get(tags_handler))
        .route("/tags/{type}/{id}", get(entity_tags_handler))
        .route("/inventory", get(inventory_handler))
        .route("/inventory/{type}/{id}", get(object_handler))
        .route("/dump", get(dump_handler))
        .route("/memory", get(memory_handler))
        .route("/doc", get(doc_handler));

    // Conditionally add health endpoint
    if config.enable_health.unwrap_or(true) {
        app = app.route("/health", get(health_handler));
    }

    let app = app.with_state(state.clone());

    let listener = TcpListener::bind(addr).await?;
    info!(
        "herakles-vmware-exporter listening on http://{}:{}",
        bind_ip_str, port
    );

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                background_task.abort();
                return Err(e.into());
            }
        }
        result = &mut background_task => {
            return match result {
                Ok(Err(e)) => {
                    error!("Collector stopped: {}", e);
                    Err(e.into())
                }
                Ok(Ok(())) => Ok(()),
                Err(e) => {
                    error!("Collector task failed: {}", e);
                    Err(e.into())
                }
            };
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received, exiting...");
        }
    }

    // Cleanup: cancel background task before exit
    background_task.abort();
    let _ = background_task.await;

    info!("herakles-vmware-exporter stopped gracefully");
    Ok(())
}
