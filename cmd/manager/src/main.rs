use std::sync::Arc;
use std::time::Duration;

use actix_web::web::Data;
use actix_web::{get, middleware, App, HttpRequest, HttpResponse, HttpServer, Responder};
use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use xrcore_engine::client::KindClient;
use xrcore_engine::engine::leader::LeaderElector;
use xrcore_engine::engine::{ControllerOpts, Engine, ReconcileOutcome};
use xrcore_engine::metrics::Metrics;
use xrcore_engine::packages::{self, Hooks, ImageFetcher, PackageParser};
use xrcore_engine::telemetry;
use xrcore_engine::types::Gvk;
use xrcore_k8s_util::client::new_client_with_metrics;

mod claim_controller;
mod composite_controller;
mod unimplemented_interfaces;
mod xrd_controller;

use unimplemented_interfaces::{NoopHooks, UnimplementedFetcher, UnimplementedParser};

struct AppState {
    metrics: Metrics,
    leader: watch::Receiver<bool>,
}

#[get("/metrics")]
async fn metrics(state: Data<AppState>, _req: HttpRequest) -> impl Responder {
    let mut buf = String::new();
    let registry = &*state.metrics.registry;
    match encode(&mut buf, registry) {
        Ok(()) => HttpResponse::Ok().content_type("application/openmetrics-text; version=1.0.0; charset=utf-8").body(buf),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(state: Data<AppState>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({"status": "healthy", "leader": *state.leader.borrow()}))
}

#[derive(Parser, Debug)]
#[command(
    name = "xrcore-manager",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port.
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format.
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint. If not provided, tracing
    /// stays local-only.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Maximum number of reconciles per second, across every controller
    /// (the global token-bucket rate shared by all reconcile loops).
    #[arg(long, default_value_t = 10.0, env)]
    max_reconcile_rate: f64,

    /// How often the watch garbage collector sweeps for stale watches.
    #[arg(long, default_value = "1h", value_parser = humantime_duration, env)]
    sync_period: Duration,

    /// Restrict the engine to a single namespace; unset watches cluster-wide.
    #[arg(long, env)]
    namespace: Option<String>,

    /// Name of the TLS secret backing the validating/mutating webhook
    /// server. The webhook server itself is out of scope; this is accepted
    /// so deployments can still pass it through unchanged.
    #[arg(long, env)]
    webhook_tls_secret_name: Option<String>,

    /// Gate the engine's controllers behind a `coordination.k8s.io/v1`
    /// Lease so only one replica reconciles at a time.
    #[arg(long, default_value_t = false, env)]
    leader_election: bool,

    /// Reconcile timeout applied to every single reconcile invocation.
    #[arg(long, default_value = "2m", value_parser = humantime_duration, env)]
    reconcile_timeout: Duration,
}

fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

const PACKAGE_REVISION_CONTROLLER: &str = "package-revision";

fn package_revision_gvk() -> Gvk {
    // Crossplane's PackageRevision kinds are actually three distinct CRDs
    // (ProviderRevision/ConfigurationRevision/FunctionRevision); this engine
    // watches the Provider family here as the concrete, statically-known GVK
    // wired at startup. Generalizing to discover every installed package
    // type's GVK at runtime belongs to the wider Crossplane type system,
    // which is out of scope.
    Gvk::new("pkg.crossplane.io", "v1", "ProviderRevision", "providerrevisions", false)
}

/// Builds the `Reconciler` closure the engine drives for `package-revision`:
/// fetch -> convert -> `reconcile_package_revision` -> write status/finalizers
/// back. `ImageFetcher`/`PackageParser`/`Hooks` are an out-of-scope
/// interface boundary, wired here to placeholder implementations that
/// surface a clear `Fatal` error rather than silently doing nothing, so a
/// misconfigured deployment fails loudly instead of reporting false health.
fn package_revision_reconciler(client: KindClient, metrics: Metrics) -> Arc<dyn xrcore_engine::engine::Reconciler> {
    let fetcher: Arc<dyn ImageFetcher> = Arc::new(UnimplementedFetcher);
    let parser: Arc<dyn PackageParser> = Arc::new(UnimplementedParser);
    let hooks: Arc<dyn Hooks> = Arc::new(NoopHooks);
    let gvk = package_revision_gvk();

    Arc::new(move |key: xrcore_engine::engine::WorkKey| {
        let client = client.clone();
        let metrics = metrics.clone();
        let fetcher = fetcher.clone();
        let parser = parser.clone();
        let hooks = hooks.clone();
        let gvk = gvk.clone();
        Box::pin(async move {
            let measurer = metrics.reconcile.count_and_measure(PACKAGE_REVISION_CONTROLLER, &xrcore_engine::telemetry::get_trace_id());
            let object = match client.get(&gvk, key.namespace.as_deref(), &key.name).await {
                Ok(obj) => obj,
                Err(e) if e.kind() == xrcore_engine::error::ErrorKind::NotFound => return ReconcileOutcome::Done,
                Err(e) => {
                    metrics.reconcile.set_failure(PACKAGE_REVISION_CONTROLLER, &key.to_string(), &e);
                    drop(measurer);
                    return ReconcileOutcome::Error(e);
                }
            };

            let mut revision = match packages::from_dynamic(&object) {
                Ok(r) => r,
                Err(e) => {
                    metrics.reconcile.set_failure(PACKAGE_REVISION_CONTROLLER, &key.to_string(), &e);
                    drop(measurer);
                    return ReconcileOutcome::Error(e);
                }
            };

            let outcome = packages::reconcile_package_revision(&client, fetcher.as_ref(), parser.as_ref(), hooks.as_ref(), &object, &mut revision).await;

            let finalizer_obj = packages::finalizer_patch(&gvk, &revision);
            if let Err(e) = client.apply(&gvk, key.namespace.as_deref(), &key.name, &finalizer_obj, false).await {
                error!(revision = %revision.name, error = %e, "failed to patch finalizers");
            }
            let status_obj = packages::status_patch(&gvk, &revision);
            if let Err(e) = client.apply_status(&gvk, key.namespace.as_deref(), &key.name, &status_obj).await {
                error!(revision = %revision.name, error = %e, "failed to patch status");
            }

            if let ReconcileOutcome::Error(ref e) = outcome {
                metrics.reconcile.set_failure(PACKAGE_REVISION_CONTROLLER, &key.to_string(), e);
            }
            if let Some(unhealthy) =
                revision.condition(xrcore_engine::types::COND_HEALTHY).filter(|c| c.status == xrcore_engine::types::ConditionStatus::False)
            {
                let reference = k8s_openapi::api::core::v1::ObjectReference {
                    api_version: Some("pkg.crossplane.io/v1".to_string()),
                    kind: Some(format!("{:?}Revision", revision.package_type)),
                    name: Some(revision.name.clone()),
                    uid: Some(revision.uid.clone()),
                    ..Default::default()
                };
                let recorder = xrcore_engine::engine::events::recorder_for(client.raw().clone(), PACKAGE_REVISION_CONTROLLER, reference);
                let err = xrcore_engine::Error::Fatal(unhealthy.message.clone().unwrap_or_else(|| unhealthy.reason.clone()));
                xrcore_engine::engine::events::record_error(&recorder, "PackageRevisionReconcile", &err).await;
            }
            drop(measurer);
            outcome
        })
    })
}

/// Concurrency the static, always-running controllers start with. The
/// dynamic per-XRD controllers `xrd_controller` starts at runtime use their
/// own `DYNAMIC_CONTROLLER_CONCURRENCY` instead.
const STATIC_CONTROLLER_CONCURRENCY: usize = 4;

async fn run_engine(engine: Arc<Engine>, cancel: CancellationToken, metrics: Metrics, sync_period: Duration) {
    engine
        .start(
            PACKAGE_REVISION_CONTROLLER,
            ControllerOpts { gvk: package_revision_gvk(), concurrency: STATIC_CONTROLLER_CONCURRENCY },
            package_revision_reconciler(engine.get_client(), metrics.clone()),
        )
        .expect("starting the package-revision controller should not fail on a clean engine");

    // The "xrd" meta-controller is what makes the engine dynamic: as XRDs
    // are installed, updated or removed, its reconciler starts and stops the
    // Composite Reconciler and Claim Binder for the kinds they define.
    engine
        .start(
            xrd_controller::XRD_CONTROLLER,
            ControllerOpts { gvk: xrd_controller::xrd_gvk(), concurrency: STATIC_CONTROLLER_CONCURRENCY },
            xrd_controller::build(engine.clone(), engine.get_client(), metrics.clone()),
        )
        .expect("starting the xrd controller should not fail on a clean engine");

    xrcore_engine::engine::gc::run(engine.clone(), metrics, sync_period, cancel).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(&args.log_filter, args.log_format, args.tracing_url.as_deref(), args.sample_ratio).await?;

    let mut registry = Registry::with_prefix("xrcore_manager");
    let mut config = Config::infer().await?;
    if let Some(ns) = &args.namespace {
        config.default_namespace = ns.clone();
    }
    let raw_client = new_client_with_metrics(config, &mut registry).await?;
    let client = KindClient::new(raw_client.clone());

    // Registered into the same `registry` as the client's HTTP metrics
    // above, so `/metrics` serves one OpenMetrics document instead of two.
    let reconcile = xrcore_engine::metrics::ReconcileMetrics::default().register(&mut registry);
    let app_metrics = Metrics { reconcile, registry: std::sync::Arc::new(registry) };

    if let Some(secret) = &args.webhook_tls_secret_name {
        info!(secret = %secret, "webhook TLS secret configured (webhook server itself is out of scope)");
    }

    let engine = Engine::new(client, args.max_reconcile_rate, args.reconcile_timeout);
    let root_cancel = CancellationToken::new();

    let (leader_rx, leader_cancel) = if args.leader_election {
        let identity = std::env::var("POD_NAME").unwrap_or_else(|_| uuid_like_identity());
        let namespace = args.namespace.clone().unwrap_or_else(|| "crossplane-system".to_string());
        let elector = LeaderElector::new(raw_client, &namespace, "xrcore-manager-leader", identity, Duration::from_secs(15));
        elector.run()
    } else {
        // No leader election: this replica is always "leader". The sender
        // is dropped immediately; `rx.borrow()` still reads the last value
        // fine, it's only `changed()`/`wait_for()` that would error once the
        // sender side is gone, and nothing calls those on this path.
        let (_tx, rx) = watch::channel(true);
        (rx, CancellationToken::new())
    };

    let engine_task = {
        let engine = engine.clone();
        let cancel = root_cancel.clone();
        let mut leader_rx = leader_rx.clone();
        let task_metrics = app_metrics.clone();
        let sync_period = args.sync_period;
        let leader_election = args.leader_election;
        tokio::spawn(async move {
            if leader_election {
                let _ = leader_rx.wait_for(|leader| *leader).await;
            }
            info!("leadership acquired, starting controllers");

            if leader_election {
                tokio::select! {
                    _ = run_engine(engine.clone(), cancel.clone(), task_metrics, sync_period) => {}
                    _ = leader_rx.wait_for(|leader| !*leader) => {
                        info!("leadership lost, stopping controllers");
                        cancel.cancel();
                        engine.stop_all().await;
                    }
                }
            } else {
                run_engine(engine, cancel, task_metrics, sync_period).await;
            }
        })
    };

    let state = Data::new(AppState { metrics: app_metrics, leader: leader_rx });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    let server_handle = server.run();
    tokio::select! {
        res = server_handle => res?,
        _ = engine_task => {},
    }

    root_cancel.cancel();
    leader_cancel.cancel();
    Ok(())
}

fn uuid_like_identity() -> String {
    format!("xrcore-manager-{}", std::process::id())
}
