// src/main.rs
//! `hostpilot` developer CLI: a one-shot process that wires the core
//! components together and dispatches a single operation from spec §6
//! (SPEC_FULL §11 "CLI surface"). Each invocation is a fresh process, so
//! the in-memory session/plan state does not survive between invocations
//! — this is a local smoke-testing harness, not the production HTTP
//! adapter the spec describes as the real transport.

mod cli;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use hostpilot::config::AppConfig;
use hostpilot::llm::PlanGeneratorPipeline;
use hostpilot::plan::PlanOrchestrator;
use hostpilot::session::SessionRegistry;
use hostpilot::{AuditSink, CredentialVault, InMemoryAuditSink, JsonlAuditSink};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    hostpilot::logging::init(&args.log_level.to_string());

    let config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return Err(e.into());
        }
    };
    info!("hostpilot starting up");

    let audit: Arc<dyn AuditSink> = match JsonlAuditSink::create(&JsonlAuditSink::default_path()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!("could not open audit log ({e}); falling back to an in-memory sink for this run");
            Arc::new(InMemoryAuditSink::new())
        }
    };

    let vault = CredentialVault::new(&config.vault)?;
    let sessions = SessionRegistry::spawn(config.limits.clone(), Arc::clone(&audit));

    let generator = build_generator(&config)?;
    let orchestrator = PlanOrchestrator::new(
        Arc::clone(&sessions),
        PlanGeneratorPipeline::new(generator),
        Arc::clone(&audit),
        config.limits.clone(),
    );

    dispatch(args.command, &args.user, &vault, &sessions, &orchestrator).await
}

#[cfg(feature = "http-provider")]
fn build_generator(config: &AppConfig) -> Result<Arc<dyn hostpilot::PlanGenerator>> {
    Ok(Arc::new(hostpilot::llm::HttpPlanGenerator::new(&config.model)))
}

#[cfg(not(feature = "http-provider"))]
fn build_generator(_config: &AppConfig) -> Result<Arc<dyn hostpilot::PlanGenerator>> {
    Err(anyhow::anyhow!(
        "no PlanGenerator is compiled in; rebuild with the default `http-provider` feature or \
         wire in your own implementation of hostpilot::PlanGenerator"
    ))
}

async fn dispatch(
    command: Commands,
    user: &str,
    vault: &CredentialVault,
    sessions: &Arc<SessionRegistry>,
    orchestrator: &PlanOrchestrator,
) -> Result<()> {
    match command {
        Commands::Connect { hostname, port, username, password, key_file, key_passphrase } => {
            let credential = cli::resolve_credential(password, key_file, key_passphrase)?;
            // The vault is exercised here the way the production adapter
            // would: seal immediately after auth to avoid holding
            // plaintext longer than necessary, unseal just before use.
            let sealed = vault.seal(&credential)?;
            let credential = vault.unseal(&sealed)?;
            let session_id = sessions.connect(user, &hostname, port, &username, credential).await?;
            println!("{{\"session_id\": \"{session_id}\", \"status\": \"connected\"}}");
        }
        Commands::Disconnect { session_id } => {
            match session_id {
                Some(session_id) => sessions.disconnect(user, session_id).await,
                None => sessions.terminate_user(user).await,
            }
            println!("{{\"ok\": true}}");
        }
        Commands::Status => {
            let sessions = sessions.list(user).await;
            let entries: Vec<String> = sessions
                .iter()
                .map(|s| {
                    format!(
                        "{{\"session_id\": \"{}\", \"hostname\": \"{}\", \"username\": \"{}\", \"port\": {}, \"status\": \"{:?}\", \"connected_at\": \"{}\"}}",
                        s.session_id, s.hostname, s.username, s.port, s.status(), s.created_at
                    )
                })
                .collect();
            println!("[{}]", entries.join(", "));
        }
        Commands::Submit { session_id, request } => {
            let plan = orchestrator.submit(user, session_id, &request).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::GetPlan { plan_id } => {
            let plan = orchestrator.get(user, plan_id).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Respond { plan_id, step_index, approved, reason } => {
            let outcome = orchestrator.respond(user, plan_id, step_index, approved, reason).await?;
            println!("{:?}", outcome);
        }
        Commands::RespondAll { plan_id, approved } => {
            let plan = orchestrator.respond_all(user, plan_id, approved).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Chat { plan_id, message } => {
            let (user_message, ai_message) = orchestrator.chat(user, plan_id, &message).await?;
            println!("{{\"user_message\": {:?}, \"ai_message\": {:?}}}", user_message, ai_message);
        }
        Commands::BeaconLeave => {
            sessions.terminate_user(user).await;
            println!("{{\"ok\": true}}");
        }
    }
    Ok(())
}
