use axum::middleware;
use clap::Parser;
use http::Request;
use modelxd::{
    auth::{auth_middleware, OidcAuthorizer},
    endpoints::router,
    gc,
    registry_store::RegistryStore,
    s3_storage::{S3Options, S3StorageDriver},
    storage::LocalStorageDriver,
    storage_driver::Backend,
};
use std::{net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "modelxd")]
#[command(version = "0.1.0")]
#[command(about = "modelx model artifact registry server", long_about = None)]
struct App {
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,
    #[arg(long, default_value = "data/registry")]
    local_basepath: PathBuf,
    #[arg(long, default_value = "", help = "S3 endpoint; selects the S3 backend when set")]
    s3_url: String,
    #[arg(long, default_value = "registry")]
    s3_bucket: String,
    #[arg(long, default_value = "")]
    s3_region: String,
    #[arg(long, env = "MODELXD_S3_ACCESS_KEY", default_value = "")]
    s3_access_key: String,
    #[arg(long, env = "MODELXD_S3_SECRET_KEY", default_value = "")]
    s3_secret_key: String,
    #[arg(long, default_value = "true")]
    s3_path_style: bool,
    #[arg(long, default_value = "3600", help = "Presigned URL lifetime in seconds")]
    s3_presign_expire: u64,
    #[arg(long, default_value = "")]
    oidc_issuer: String,
    #[arg(long, default_value = "false", help = "Answer blob GET/PUT with presigned redirects")]
    enable_redirect: bool,
    #[arg(long)]
    tls_cert: Option<PathBuf>,
    #[arg(long)]
    tls_key: Option<PathBuf>,
    #[arg(long)]
    tls_ca: Option<PathBuf>,
    #[arg(long, help = "Remove unreferenced blobs from a repository, then exit")]
    gc_repository: Option<String>,
}

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(true)
        .finish();
    subscriber.with(tracing_subscriber::fmt::layer()).init();
    let _ = dotenvy::dotenv().ok();
    let args = App::parse();

    let backend = if !args.s3_url.is_empty() {
        let options = S3Options {
            url: args.s3_url.clone(),
            region: args.s3_region.clone(),
            bucket: args.s3_bucket.clone(),
            access_key: args.s3_access_key.clone(),
            secret_key: args.s3_secret_key.clone(),
            path_style: args.s3_path_style,
            presign_expire_secs: args.s3_presign_expire,
        };
        Backend::S3(
            S3StorageDriver::new(&options)
                .await
                .expect("unable to configure s3 storage"),
        )
    } else {
        Backend::Local(
            LocalStorageDriver::new(&args.local_basepath)
                .await
                .expect("unable to create storage directory"),
        )
    };
    info!("storage backend: {:?}", backend.kind());

    let store = match RegistryStore::new(backend, args.enable_redirect).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("invalid registry configuration: {e}");
            std::process::exit(1);
        }
    };
    handle_args(&args, &store).await;

    let mut app = router(store).layer(
        ServiceBuilder::new().layer(TraceLayer::new_for_http().make_span_with(
            |request: &Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    status_code = tracing::field::Empty,
                )
            },
        )),
    );

    if !args.oidc_issuer.is_empty() {
        let authorizer = OidcAuthorizer::discover(&args.oidc_issuer)
            .await
            .unwrap_or_else(|e| {
                eprintln!("oidc discovery failed: {e}");
                std::process::exit(1);
            });
        app = app.layer(middleware::from_fn_with_state(authorizer, auth_middleware));
    }

    let addr = SocketAddr::from_str(&args.listen).unwrap_or_else(|_| {
        eprintln!("Invalid address: {}", args.listen);
        std::process::exit(1);
    });

    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .expect("unable to load tls certificate");
            println!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, config)
                .serve(app.into_make_service())
                .await
                .expect("unable to start server");
        }
        _ => {
            println!("Listening on {}", addr);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .expect("unable to bind to port");
            axum::serve(listener, app.into_make_service())
                .await
                .expect("unable to start server");
        }
    }
}

async fn handle_args(args: &App, store: &Arc<RegistryStore>) {
    if let Some(repository) = &args.gc_repository {
        match gc::gc_repository(store, repository).await {
            Ok(disposition) => {
                for (digest, outcome) in &disposition {
                    println!("{digest}: {outcome}");
                }
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("garbage collect failed: {e}");
                std::process::exit(1);
            }
        }
    }
}
