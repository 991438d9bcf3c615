use s3s_post::auth::StaticCredentials;
use s3s_post::config::{PostConfig, StaticConfigProvider};
use s3s_post::service::PostServiceBuilder;
use s3s_post_fs::FileSystem;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;

use clap::{CommandFactory, Parser};
use tracing::info;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;

#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Host name to listen on.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port number to listen on.
    #[arg(long, default_value = "8014")]
    port: u16,

    /// Access key used for authentication.
    #[arg(long, requires = "secret_key", required_unless_present = "credentials")]
    access_key: Option<String>,

    /// Secret key used for authentication.
    #[arg(long, requires = "access_key")]
    secret_key: Option<String>,

    /// JSON file mapping access keys to secret keys.
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// JSON file with upload limits. Defaults apply to missing entries.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rejects uploads whose form does not carry a `bucket` field.
    #[arg(long)]
    require_bucket_field: bool,

    /// Rejects form fields that no policy condition covers.
    #[arg(long)]
    strict_form_fields: bool,

    /// Root directory of stored objects.
    root: PathBuf,
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env();
    let enable_color = std::io::stdout().is_terminal();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(env_filter)
        .with_ansi(enable_color)
        .init();
}

fn check_cli_args(opt: &Opt) {
    use clap::error::ErrorKind;

    let mut cmd = Opt::command();

    let empty = |s: &Option<String>| s.as_deref().is_some_and(str::is_empty);
    if empty(&opt.access_key) || empty(&opt.secret_key) {
        let msg = "access key and secret key must not be empty";
        cmd.error(ErrorKind::ValueValidation, msg).exit();
    }
}

fn load_credentials(opt: &Opt) -> anyhow::Result<StaticCredentials> {
    let mut credentials = match &opt.credentials {
        Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
        None => StaticCredentials::new(),
    };
    if let (Some(access_key), Some(secret_key)) = (&opt.access_key, &opt.secret_key) {
        credentials.insert(access_key.as_str(), secret_key.as_str());
    }
    anyhow::ensure!(credentials.lookup("").is_none(), "access key must not be empty");
    Ok(credentials)
}

fn load_config(opt: &Opt) -> anyhow::Result<PostConfig> {
    let mut config = match &opt.config {
        Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
        None => PostConfig::default(),
    };
    if opt.require_bucket_field {
        config.require_bucket_field = true;
    }
    if opt.strict_form_fields {
        config.strict_form_fields = true;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    check_cli_args(&opt);

    setup_tracing();

    run(opt)
}

#[tokio::main]
async fn run(opt: Opt) -> anyhow::Result<()> {
    let config = load_config(&opt)?;
    info!(?config, "loaded upload limits");
    let auth = load_credentials(&opt)?;

    // Setup storage backend
    let fs = FileSystem::new(&opt.root).map_err(|e| anyhow::anyhow!(e.into_inner()))?;
    info!(root = %fs.root().display(), "storing objects");

    // Setup POST service
    let service = {
        let mut b = PostServiceBuilder::new(auth, fs);
        b.set_config(Arc::new(StaticConfigProvider::new(Arc::new(config))));
        b.build()
    };

    // Run server
    let listener = TcpListener::bind((opt.host.as_str(), opt.port)).await?;
    let local_addr = listener.local_addr()?;

    let http_server = ConnBuilder::new(TokioExecutor::new());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    info!("server is running at http://{local_addr}");

    loop {
        let (socket, _) = tokio::select! {
            res =  listener.accept() => {
                match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::error!("error accepting connection: {err}");
                        continue;
                    }
                }
            }
            _ = ctrl_c.as_mut() => {
                break;
            }
        };

        let conn = http_server.serve_connection(TokioIo::new(socket), service.clone());
        let conn = graceful.watch(conn.into_owned());
        tokio::spawn(async move {
            let _ = conn.await;
        });
    }

    tokio::select! {
        () = graceful.shutdown() => {
             tracing::debug!("Gracefully shutdown!");
        },
        () = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
             tracing::debug!("Waited 10 seconds for graceful shutdown, aborting...");
        }
    }

    info!("server is stopped");
    Ok(())
}
