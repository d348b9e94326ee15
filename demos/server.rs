use axum::{extract::Path, routing::get, Extension, Router};
use tallyho::{Fault, Reporter, Settings, StatsdClient};
use tracing_subscriber::{fmt, EnvFilter};

async fn index() -> &'static str {
    "Success!"
}

async fn item(Path(id): Path<u64>, Extension(client): Extension<StatsdClient>) -> String {
    let _ = client.increment("demo.item.lookups", 1, &["source:demo"]);
    format!("item {id}")
}

async fn broken() -> Result<&'static str, Fault> {
    Err(Fault::internal())
}

#[tokio::main]
pub async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    // Override for local testing
    std::env::set_var(tallyho::client::STATSD_HOST_ENV, "0.0.0.0");
    let settings = match std::env::args().nth(1) {
        Some(path) => tallyho::config::load_from_file(&path).expect("Failed to load settings!"),
        None => Settings::default(),
    };
    let reporter = Reporter::new(settings).expect("Failed to instantiate reporter!");

    let app = reporter.attach(
        Router::new()
            .route("/", get(index).options(index))
            .route("/items/:id", get(item))
            .route("/err", get(broken)),
    );

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000")
        .await
        .expect("failed to bind");
    tracing::info!("demo server listening on 0.0.0.0:3000");
    axum::serve(listener, app)
        .with_graceful_shutdown(reporter.clone().close_on(async {
            let _ = tokio::signal::ctrl_c().await;
        }))
        .await
        .expect("server failed");
}
