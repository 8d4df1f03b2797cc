use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use clap::Parser;
use serde_json::{Map, Value};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use classhub::api::{self, AppState};
use classhub::assistant::{
    AssistantKind, AssistantProfile, ChatAssistant, GeminiBackend, GenerationBackend, UnconfiguredBackend,
};
use classhub::config::{self, Config};
use classhub::models::session::{Role, Session};
use classhub::notification::{FeedSnapshot, NotificationSurface};
use classhub::store::memory::MemoryStore;
use classhub::store::postgres::PgStore;
use classhub::store::DocumentStore;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Export spans over OTLP when OTEL_EXPORTER_OTLP_ENDPOINT is set;
    // otherwise log to stdout only.
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "classhub"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "classhub=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Notify { message, kind, link }) => {
            let store = build_store(&cfg).await?;
            handle_notify(store.as_ref(), message, kind, link).await
        }
        Some(cli::Commands::Feed {
            user,
            role,
            mark,
            mark_all,
            follow,
        }) => {
            let store = build_store(&cfg).await?;
            let role: Role = role.parse().map_err(anyhow::Error::msg)?;
            handle_feed(&cfg, store, Session::new(user, role), mark, mark_all, follow).await
        }
        Some(cli::Commands::Chat { assistant, message }) => {
            let kind: AssistantKind = assistant.parse().map_err(anyhow::Error::msg)?;
            let store = Arc::new(MemoryStore::new());
            let state = build_state(cfg, store)?;
            let reply = state.assistant(kind).reply(&[], &message).await;
            println!("{}", reply);
            Ok(())
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Postgres when `DATABASE_URL` is set, otherwise the in-process store.
async fn build_store(cfg: &Config) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match &cfg.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(url).await?;

            tracing::info!("Running migrations...");
            db.migrate().await?;
            Ok(Arc::new(db))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set; using the in-process store (data is not persisted)");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_state(cfg: Config, store: Arc<dyn DocumentStore>) -> anyhow::Result<AppState> {
    let backend: Arc<dyn GenerationBackend> = match &cfg.gemini_api_key {
        Some(key) => Arc::new(GeminiBackend::new(key.clone(), cfg.gemini_base_url.clone())?),
        None => Arc::new(UnconfiguredBackend),
    };

    let general = ChatAssistant::new(backend.clone(), AssistantProfile::general(cfg.chat_model.clone()));
    let resources = ChatAssistant::new(
        backend,
        AssistantProfile::resources(cfg.chat_model.clone(), cfg.admin_contact()),
    );

    Ok(AppState {
        store,
        config: cfg,
        general,
        resources,
    })
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let store = build_store(&cfg).await?;
    tracing::info!(
        mode = ?cfg.presentation(),
        model = %cfg.chat_model,
        "Starting ClassHub"
    );
    let state = Arc::new(build_state(cfg, store)?);

    let app = api::app(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer({
            use axum::http::{HeaderName, Method};
            use tower_http::cors::AllowOrigin;
            let web_origin = std::env::var("CLASSHUB_WEB_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string());
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _| {
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str == web_origin
                        || origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static("x-classhub-user-id"),
                    HeaderName::from_static("x-classhub-role"),
                    HeaderName::from_static("x-request-id"),
                ])
                .allow_credentials(true)
        })
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("ClassHub listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: injects security headers into every response.
async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove("Server");

    resp
}

async fn handle_notify(
    store: &dyn DocumentStore,
    message: String,
    kind: String,
    link: Option<String>,
) -> anyhow::Result<()> {
    let mut data = Map::new();
    data.insert("message".into(), Value::String(message));
    data.insert("type".into(), Value::String(kind));
    data.insert("read".into(), Value::Bool(false));
    if let Some(link) = link {
        data.insert("link".into(), Value::String(link));
    }

    let doc = store.insert("notifications", data).await?;
    println!("✅ Notification created: {}", doc.id);
    Ok(())
}

fn print_snapshot(snapshot: &FeedSnapshot) {
    println!("{} unread", snapshot.unread_count());
    for item in &snapshot.items {
        let marker = if item.read { " " } else { "•" };
        println!(
            "{} {}  [{}] {}  {}",
            marker,
            item.created_at.format("%Y-%m-%d %H:%M"),
            item.r#type,
            item.message,
            item.id
        );
    }
}

async fn handle_feed(
    cfg: &Config,
    store: Arc<dyn DocumentStore>,
    session: Session,
    mark: Option<String>,
    mark_all: bool,
    follow: bool,
) -> anyhow::Result<()> {
    let surface = NotificationSurface::mount(store, cfg.presentation(), cfg.feed_limit, cfg.toast_limit);
    let mut updates = surface.feed().updates();
    surface.sign_in(session);

    let snapshot = surface
        .loaded(Duration::from_secs(10))
        .await
        .context("notification feed did not load")?;
    print_snapshot(&snapshot);
    updates.borrow_and_update();

    if let Some(id) = mark {
        surface.feed().mark_as_read(&id).await?;
    } else if mark_all {
        surface.feed().mark_all_as_read().await?;
    }

    for toast in surface.visible_toasts() {
        println!("⚠️  {}: {}", toast.title, toast.description);
    }

    if follow {
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = updates.borrow_and_update().clone();
                    if snapshot.loaded {
                        print_snapshot(&snapshot);
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    surface.unmount();
    Ok(())
}
