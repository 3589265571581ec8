use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use reqwest::Method;
use std::sync::Arc;

use session_keeper::auth::{CredentialStore, SignInCredentials, SqliteCookieStore};
use session_keeper::broadcast::BroadcastHub;
use session_keeper::config::{Command, Config, LogFormat};
use session_keeper::context::{ClientContext, ExecutionContext, LogNavigator};
use session_keeper::http_client::{ApiClient, ApiRequest};
use session_keeper::routes;
use session_keeper::session::SessionProvider;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    tracing::debug!(api_url = %config.api_url, command = ?command, "Session Keeper starting");

    match command {
        Command::Serve => serve(config).await,
        Command::Login { email } => {
            let session = open_session(&config)?;
            login(&session, email).await
        }
        Command::Logout => {
            let session = open_session(&config)?;
            session.sign_out();
            println!("Signed out");
            Ok(())
        }
        Command::Whoami => {
            let session = open_session(&config)?;
            session.start().await;
            match session.current_user() {
                Some(identity) => println!("{}", serde_json::to_string_pretty(&identity)?),
                None => println!("Not signed in"),
            }
            Ok(())
        }
        Command::Request { method, path, data } => {
            let session = open_session(&config)?;
            send(&session, &method, &path, data.as_deref()).await
        }
    }
}

/// Open this process's tab over the persistent cookie jar
fn open_session(config: &Config) -> Result<SessionProvider> {
    let jar = SqliteCookieStore::open(&config.cookie_db_file)?;
    tracing::debug!(path = %config.cookie_db_file.display(), "Cookie jar opened");

    let store = CredentialStore::with_ttl(Arc::new(jar), config.token_ttl());
    let hub = BroadcastHub::new();
    let context = ClientContext::new(
        store.clone(),
        Arc::new(LogNavigator),
        Arc::new(hub.open_session()),
    );

    let client = ApiClient::new(
        &config.api_url,
        store,
        ExecutionContext::Client(context),
        config.http_connect_timeout,
        config.http_request_timeout,
    )?;

    Ok(SessionProvider::new(client)?)
}

async fn login(session: &SessionProvider, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => Input::new()
            .with_prompt("E-mail")
            .interact_text()
            .context("Failed to read e-mail")?,
    };

    let password: String = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")?;

    session.sign_in(SignInCredentials::new(email, password)).await;

    match session.current_user() {
        Some(identity) => {
            println!("Signed in as {}", identity.email);
            Ok(())
        }
        None => anyhow::bail!("Sign in failed, see log for details"),
    }
}

async fn send(session: &SessionProvider, method: &str, path: &str, data: Option<&str>) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let mut request = ApiRequest::new(method, path);
    if let Some(data) = data {
        let body = serde_json::from_str(data).context("--data is not valid JSON")?;
        request = request.json(body);
    }

    let response = session.client().request(request).await?;
    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;

    eprintln!("{}", status);
    println!("{}", body);
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let state = routes::AppState::new(config)?;
    let app = routes::app(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(addr = %addr, "Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
