use std::sync::Arc;

use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use metergate::store::{CredentialStore, TagStore};
use metergate::{
    AppState, Authenticator, Config, EventValidator, KeyHasher, SqliteStore, TagResolver, router,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let mut listen_override: Option<String> = None;
    let mut db_override: Option<std::path::PathBuf> = None;
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_override = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--db" => {
                db_override = Some(args.next().ok_or("missing value for --db")?.into());
            }
            "--json-logs" => {
                json_logs = true;
            }
            _ => {
                return Err(
                    "usage: metergate [--listen HOST:PORT] [--db PATH] [--json-logs]".into(),
                );
            }
        }
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    let mut config = Config::from_env()?;
    if let Some(listen) = listen_override {
        config.listen = listen
            .parse()
            .map_err(|_| format!("invalid --listen value: {listen}"))?;
    }
    if let Some(path) = db_override {
        config.database_path = path;
    }

    let store = Arc::new(SqliteStore::new(config.database_path.clone()));
    store.init().await?;

    let hasher = KeyHasher::new(&config.hash_secret)?;
    let auth = Arc::new(Authenticator::new(
        Arc::clone(&store) as Arc<dyn CredentialStore>,
        hasher,
    ));
    let validator = Arc::new(EventValidator::new(TagResolver::new(
        Arc::clone(&store) as Arc<dyn TagStore>,
    )));
    let state = AppState::new(auth, validator, store, config.lemon_squeezy.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(listen = %config.listen, db = %config.database_path.display(), "metergate listening");
    axum::serve(listener, app).await?;
    Ok(())
}
