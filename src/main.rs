use baymax::adapters::{FileCredentialsProvider, ReqwestHttpClient, TungsteniteConnector};
use baymax::auth::TokenStore;
use baymax::cli::{parse_args, version_string, CliCommand, USAGE};
use baymax::config::ClientConfig;
use baymax::reports::{BehaviorReport, ImageAnalysis, PersonList, ReportClient};
use baymax::websocket::{
    AnalysisEvent, SessionFactory, SessionHandle, SupervisedSession, SupervisorState,
};

use bytes::Bytes;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How long to wait for the server's final metrics after `stop`.
const STOP_GRACE: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let command = parse_args(std::env::args());

    match &command {
        CliCommand::Version => {
            println!("{}", version_string());
            return Ok(());
        }
        CliCommand::Help => {
            println!("{}", USAGE);
            return Ok(());
        }
        CliCommand::Invalid(reason) => {
            eprintln!("Error: {}\n\n{}", reason, USAGE);
            std::process::exit(2);
        }
        _ => {}
    }

    color_eyre::install()?;
    init_tracing();

    let config = ClientConfig::from_env();
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async move {
        let http = Arc::new(ReqwestHttpClient::with_timeout(config.http_timeout));
        let credentials = Arc::new(
            FileCredentialsProvider::new().map_err(|e| eyre!("Credentials unavailable: {}", e))?,
        );
        let tokens =
            Arc::new(TokenStore::from_config(&config, http.clone()).with_credentials(credentials));
        tokens.restore().await;

        match command {
            CliCommand::Login => login(&tokens).await,
            CliCommand::Stream { subject, frames } => {
                ensure_logged_in(&tokens).await?;
                stream(&config, tokens, subject, frames).await
            }
            CliCommand::Report { subject } => {
                ensure_logged_in(&tokens).await?;
                let client = ReportClient::new(http, tokens);
                let report = client
                    .behavior_report(subject)
                    .await
                    .map_err(|e| eyre!("{}", e))?;
                print_report(&report);
                Ok(())
            }
            CliCommand::Persons => {
                ensure_logged_in(&tokens).await?;
                let client = ReportClient::new(http, tokens);
                let persons = client.persons().await.map_err(|e| eyre!("{}", e))?;
                print_persons(&persons);
                Ok(())
            }
            CliCommand::Analyze { image } => {
                ensure_logged_in(&tokens).await?;
                let data = tokio::fs::read(&image)
                    .await
                    .wrap_err_with(|| format!("Failed to read {}", image.display()))?;
                let client = ReportClient::new(http, tokens);
                let analysis = client
                    .analyze_image(&data)
                    .await
                    .map_err(|e| eyre!("{}", e))?;
                print_analysis(&analysis);
                Ok(())
            }
            _ => Ok(()),
        }
    })
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("baymax=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn login(tokens: &TokenStore) -> Result<()> {
    print!("Username: ");
    io::stdout().flush()?;
    let mut username = String::new();
    io::stdin().lock().read_line(&mut username)?;

    print!("Password: ");
    io::stdout().flush()?;
    let password = rpassword::read_password().wrap_err("Failed to read password")?;

    let result = tokens.login(username.trim(), &password).await;
    if !result.success {
        bail!("Login failed: {}", result.message);
    }

    match result.identity {
        Some(identity) => println!("Logged in as {}", identity.username),
        None => println!("Logged in"),
    }
    Ok(())
}

/// A saved session is good if the profile loads, possibly after a refresh.
async fn ensure_logged_in(tokens: &TokenStore) -> Result<()> {
    if !tokens.is_authenticated() {
        bail!("Not logged in. Run `baymax login` first.");
    }
    if tokens.profile().await.is_some() {
        return Ok(());
    }
    if tokens.refresh().await && tokens.profile().await.is_some() {
        return Ok(());
    }
    bail!("Saved session expired. Run `baymax login` again.")
}

async fn stream(
    config: &ClientConfig,
    tokens: Arc<TokenStore>,
    subject: i64,
    paths: Vec<PathBuf>,
) -> Result<()> {
    let mut frames = Vec::with_capacity(paths.len());
    for path in &paths {
        let data = tokio::fs::read(path)
            .await
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        frames.push(Bytes::from(data));
    }
    if frames.is_empty() {
        bail!("No frames to send");
    }

    let factory = SessionFactory::from_config(config, Arc::new(TungsteniteConnector::new()))
        .with_tokens(tokens);
    let session = SupervisedSession::spawn(
        factory,
        SessionHandle::for_subject(subject),
        config.reconnect.clone(),
    );
    let mut events = session.events();
    let mut state = session.state_receiver();

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    println!("Streaming {} frame(s) for subject {}. Ctrl-C to stop.", frames.len(), subject);

    let mut ticker = tokio::time::interval(config.frame_interval);
    let mut next = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.wait_for(|s| *s == SupervisorState::Stopped) => {
                if changed.is_ok() {
                    eprintln!("Connection lost for good");
                }
                break;
            }
            _ = ticker.tick() => {
                if session.state() == SupervisorState::Open {
                    session.send_frame(frames[next % frames.len()].clone());
                    next += 1;
                }
            }
        }
    }

    session.request_metrics();
    session.stop();
    if tokio::time::timeout(STOP_GRACE, session.stopped()).await.is_err() {
        session.shutdown();
    }
    let _ = printer.await;

    println!("Sent {} frame(s), {} dropped", next, session.dropped_frames());
    Ok(())
}

fn print_event(event: &AnalysisEvent) {
    match event {
        AnalysisEvent::SessionStarted(started) => match started.session_id {
            Some(id) => println!("session {} started", id),
            None => println!("session started"),
        },
        AnalysisEvent::AnalysisResult(result) => {
            let mut flags = Vec::new();
            if result.head_down {
                flags.push("head down");
            }
            if result.hunched {
                flags.push("hunched");
            }
            if result.hands_on_face {
                flags.push("hands on face");
            }
            println!(
                "{:<10} {:<9} {}",
                result.emotion.as_deref().unwrap_or("-"),
                result.overall_state,
                flags.join(", ")
            );
        }
        AnalysisEvent::MetricsUpdate(update) => match update.typed() {
            Some(metrics) => println!(
                "metrics: {} frames, {} alert(s)",
                metrics.total_frames,
                metrics.alerts.len()
            ),
            None => println!("metrics: {}", serde_json::Value::Object(update.payload.clone())),
        },
        AnalysisEvent::ErrorEvent(error) => eprintln!("error: {}", error.message),
        AnalysisEvent::SessionEnded(_) => println!("session ended"),
    }
}

fn print_report(report: &BehaviorReport) {
    if let Some(person) = &report.person {
        println!("{} (#{})", person.full_name, person.id);
    }
    if !report.has_data() {
        println!("{}", report.message.as_deref().unwrap_or("No data"));
        return;
    }

    println!("Sessions: {}", report.total_sessions);
    for (emotion, pct) in &report.average_emotions {
        println!("  {:<10} {:>6.2}%", emotion, pct);
    }
    for (state, count) in &report.state_distribution {
        println!("  {:<10} {} session(s)", state, count);
    }
    if let Some(tendency) = &report.overall_tendency {
        println!("Tendency: {}", tendency);
    }
    if let Some(recommendation) = &report.recommendation {
        println!("[{}] {}", recommendation.level, recommendation.message);
        for suggestion in &recommendation.suggestions {
            println!("  - {}", suggestion);
        }
    }
}

fn print_persons(list: &PersonList) {
    if list.persons.is_empty() {
        println!("No persons registered");
        return;
    }
    for person in &list.persons {
        println!("{:>6}  {:<30} {}", person.id, person.full_name, person.email);
    }
}

fn print_analysis(analysis: &ImageAnalysis) {
    let still = &analysis.analysis;
    println!(
        "{:<10} {}",
        still.result.emotion.as_deref().unwrap_or("-"),
        still.result.overall_state
    );
    for (emotion, score) in &still.result.emotion_scores {
        println!("  {:<10} {:>6.2}", emotion, score);
    }
    if let Some(error) = still.emotion_error.as_deref().or(still.posture_error.as_deref()) {
        eprintln!("partial result: {}", error);
    }
}
