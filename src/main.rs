mod colors;
mod config;
mod error;
mod models;
mod server;

mod auth;
mod format;
mod kv;
mod stream;
mod upstream;

use std::env;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use auth::device;
use colors::*;
use config::Config;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use server::ServerState;

/// A simple animated spinner for terminal feedback
struct Spinner {
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Spinner {
    fn new(message: &str) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let message = message.to_string();

        let handle = std::thread::spawn(move || {
            let frames = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
            let mut i = 0;
            while running_clone.load(Ordering::Relaxed) {
                print!("\r{CYAN}{}{RESET} {}", frames[i % frames.len()], message);
                let _ = std::io::stdout().flush();
                std::thread::sleep(std::time::Duration::from_millis(80));
                i += 1;
            }
            print!("\r\x1b[K");
            let _ = std::io::stdout().flush();
        });

        Self {
            running,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Options shared by `serve` and the bare invocation.
#[derive(Debug, Default)]
struct ServeArgs {
    port: Option<u16>,
    host: Option<String>,
    debug: bool,
}

fn parse_serve_args(args: &[String]) -> Result<ServeArgs, String> {
    let mut parsed = ServeArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-p" | "--port" => {
                let value = iter.next().ok_or("--port needs a value")?;
                parsed.port = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid port '{}'", value))?,
                );
            }
            "--host" => {
                parsed.host = Some(iter.next().ok_or("--host needs a value")?.clone());
            }
            "-d" | "--debug" => parsed.debug = true,
            other => return Err(format!("unknown option '{}'", other)),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("serve");

    match command {
        "login" => {
            init_logging_foreground(false);
            let username = args
                .iter()
                .position(|a| a == "--username" || a == "-u")
                .and_then(|i| args.get(i + 1))
                .cloned();
            if let Err(e) = run_login(username).await {
                report_error("Login failed", &e);
                std::process::exit(1);
            }
        }
        "users" => {
            init_logging_foreground(false);
            if let Err(e) = run_users_command().await {
                report_error("Failed to list users", &e);
                std::process::exit(1);
            }
        }
        "-h" | "--help" | "help" => print_help(),
        "-V" | "--version" | "version" => {
            println!("acpc {}", env!("CARGO_PKG_VERSION"));
        }
        "serve" | "-p" | "--port" | "--host" | "-d" | "--debug" => {
            let rest = if command == "serve" {
                args.get(2..).unwrap_or_default()
            } else {
                args.get(1..).unwrap_or_default()
            };
            let serve_args = match parse_serve_args(rest) {
                Ok(a) => a,
                Err(e) => {
                    eprintln!("{RED}Error:{RESET} {}", e);
                    eprintln!("Run 'acpc help' for usage.");
                    std::process::exit(2);
                }
            };
            run_server(serve_args).await;
        }
        other => {
            eprintln!("{RED}Unknown command:{RESET} {}", other);
            eprintln!("Run 'acpc help' for usage.");
            std::process::exit(2);
        }
    }
}

fn load_config() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{RED}Config error:{RESET} {}", e);
            std::process::exit(1);
        }
    }
}

fn report_error(context: &str, e: &error::Error) {
    eprintln!("{RED}{}:{RESET} {}", context, e);
    if let Some(suggestion) = e.suggestion() {
        eprintln!();
        eprintln!("  {YELLOW}Tip:{RESET} {}", suggestion);
    }
}

async fn run_server(args: ServeArgs) {
    let config = load_config().with_overrides(args.port, args.host, args.debug);
    init_logging_foreground(config.logging.debug);

    let addr: SocketAddr = match format!("{}:{}", config.host(), config.port()).parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("{RED}Invalid listen address:{RESET} {}", e);
            std::process::exit(1);
        }
    };

    info!(
        kv = %config.kv.backend,
        account_type = %config.upstream.account_type,
        fallback = config.auth.long_term_token.is_some(),
        "Starting acpc"
    );

    let state = match ServerState::new(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            report_error("Failed to start", &e);
            std::process::exit(1);
        }
    };

    println!();
    println!("  {BOLD}{GREEN}acpc{RESET} {DIM}v{}{RESET}", env!("CARGO_PKG_VERSION"));
    println!("  Listening on {CYAN}http://{}{RESET}", addr);
    println!();

    if let Err(e) = run_server_with_shutdown(addr, state).await {
        eprintln!("{RED}Server error:{RESET} {}", e);
        std::process::exit(1);
    }
}

fn init_logging_foreground(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("acpc=debug,warn"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("acpc=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

async fn run_server_with_shutdown(
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Server listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal, stopping server");
                break;
            }
            result = listener.accept() => {
                let (stream, remote_addr) = result?;
                let state = state.clone();

                tokio::spawn(async move {
                    if let Err(e) = server::handle_connection(stream, remote_addr, state).await {
                        warn!(error = %e, remote = %remote_addr, "Connection error");
                    }
                });
            }
        }
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn prompt_error(e: dialoguer::Error) -> error::Error {
    error::Error::Io(std::io::Error::other(e))
}

/// GitHub device flow, then store the token as a user registration or as
/// the process-wide fallback.
async fn run_login(username: Option<String>) -> error::Result<()> {
    let config = load_config().with_overrides(None, None, false);
    let github_base = config.upstream.github_base.clone();
    let state = ServerState::new(config)?;

    let code = device::request_device_code(&state.http, &github_base).await?;

    println!();
    println!(
        "{BOLD}Step 1:{RESET} Open {CYAN}{}{RESET}",
        code.verification_uri
    );
    println!("{BOLD}Step 2:{RESET} Enter the code {BOLD}{YELLOW}{}{RESET}", code.user_code);
    println!();

    let spinner = Spinner::new("Waiting for authorization...");
    let result = device::wait_for_access_token(&state.http, &github_base, &code, |_| {}).await;
    spinner.stop();
    let token = result?.access_token;

    // A token that cannot be exchanged is not worth storing.
    state.tokens.resolve_upstream_token(&token).await?;
    println!("{GREEN}✓{RESET} GitHub authorization complete");

    let username = match username {
        Some(name) => Some(name),
        None => {
            let choice = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("Store this token as")
                .items(&["A named user (/{user}/... routes)", "The default token (/v1/... routes)"])
                .default(0)
                .interact_opt()
                .map_err(prompt_error)?;
            match choice {
                Some(0) => Some(
                    Input::<String>::with_theme(&ColorfulTheme::default())
                        .with_prompt("Username")
                        .interact_text()
                        .map_err(prompt_error)?,
                ),
                Some(_) => None,
                None => {
                    println!("{DIM}Cancelled.{RESET}");
                    return Ok(());
                }
            }
        }
    };

    match username {
        Some(name) => {
            let record = state.users.register(&name, None, &token).await?;
            println!();
            println!("  Username: {BOLD}{}{RESET}", record.username);
            println!("  Password: {BOLD}{}{RESET}", record.password);
            println!();
            println!(
                "  {DIM}Send the password as a bearer token to /{}/v1/...{RESET}",
                record.username
            );
        }
        None => {
            state.tokens.store_fallback_credential(&token).await?;
            println!("{GREEN}✓{RESET} Stored as the default token");
        }
    }

    Ok(())
}

async fn run_users_command() -> error::Result<()> {
    let config = load_config().with_overrides(None, None, false);
    let state = ServerState::new(config)?;
    let users = state.users.list().await?;

    if users.is_empty() {
        println!("{DIM}No registered users. Run 'acpc login' to add one.{RESET}");
        return Ok(());
    }
    println!("{BOLD}Registered users:{RESET}");
    for user in users {
        println!("  {CYAN}{}{RESET}", user);
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"
{BOLD}acpc{RESET} {DIM}OpenAI and Anthropic clients on a Copilot-style upstream{RESET}

{BOLD}USAGE:{RESET}  {GREEN}acpc{RESET} [COMMAND] [OPTIONS]

{BOLD}COMMANDS{RESET}
  {YELLOW}serve{RESET}       Run the gateway (default)
  {YELLOW}login{RESET}       Authorize with GitHub and store the token
  {YELLOW}users{RESET}       List registered users
  {YELLOW}help{RESET}        Show this help
  {YELLOW}version{RESET}     Show the version

{BOLD}SERVE OPTIONS{RESET}
  -p, --port <PORT>   Listen port (default 8787, env PORT)
      --host <HOST>   Listen address (default 127.0.0.1)
  -d, --debug         Debug logging

{BOLD}LOGIN OPTIONS{RESET}
  -u, --username <NAME>   Register under NAME without prompting

{BOLD}ENVIRONMENT{RESET}
  LONG_TERM_TOKEN     Default GitHub token for /v1/... routes
  CF_ACCOUNT_ID, CF_KV_NAMESPACE_ID, CF_API_TOKEN
                      Use Cloudflare KV for storage
  RUST_LOG            Log filter, e.g. acpc=debug

{DIM}Config: {}{RESET}
"#,
        Config::path().display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_serve_args() {
        let parsed = parse_serve_args(&args(&["-p", "9000", "--host", "0.0.0.0", "-d"])).unwrap();
        assert_eq!(parsed.port, Some(9000));
        assert_eq!(parsed.host.as_deref(), Some("0.0.0.0"));
        assert!(parsed.debug);
    }

    #[test]
    fn test_parse_serve_args_errors() {
        assert!(parse_serve_args(&args(&["--port"])).is_err());
        assert!(parse_serve_args(&args(&["--port", "high"])).is_err());
        assert!(parse_serve_args(&args(&["--verbose"])).is_err());
    }
}
