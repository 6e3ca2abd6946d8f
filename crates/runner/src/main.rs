mod prompt;

use kt_common::config::AppConfig;
use kt_engine::pipeline::{PipelineError, PipelineOrchestrator};
use kt_engine::session::OperatorSession;
use kt_engine::sim::SimNetwork;

use crate::prompt::TerminalPrompt;

const USAGE: &str = "usage: kt-runner <stats|mint|harvest|rebalance>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kt_runner=info,kt_engine=info".into()),
        )
        .json()
        .init();

    let command = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!(USAGE))?;

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!(account = %config.account, command = %command, "KT vault runner starting");

    // Ledger clients; the paper network stands in for both ledgers and the oracle
    let network = SimNetwork::paper(&config);
    let home = network.home(config.account.clone());
    let liquidity = network.liquidity(config.account.clone());
    let orchestrator = PipelineOrchestrator::new(&home, &liquidity, &network, &config);

    let prompt = TerminalPrompt::new();
    let session = OperatorSession::new(&orchestrator, &prompt);

    let report = match command.as_str() {
        "stats" => serde_json::to_string_pretty(&session.stats().await?)?,
        "mint" => serde_json::to_string_pretty(&session.self_mint().await.map_err(report_failure)?)?,
        "harvest" => serde_json::to_string_pretty(&session.harvest().await.map_err(report_failure)?)?,
        "rebalance" => {
            serde_json::to_string_pretty(&session.rebalance().await.map_err(report_failure)?)?
        }
        other => anyhow::bail!("unknown command `{other}`; {USAGE}"),
    };
    println!("{report}");

    tracing::info!("KT vault runner stopped.");
    Ok(())
}

/// Print where a halted run left the funds before exiting with the error.
fn report_failure(e: PipelineError) -> anyhow::Error {
    if let Some(run) = e.run() {
        match serde_json::to_string_pretty(run) {
            Ok(json) => eprintln!("{json}"),
            Err(err) => tracing::error!(error = %err, "Failed to serialize halted run"),
        }
    }
    if e.cause().needs_operator() {
        tracing::error!(error = %e, "Manual reconciliation required");
    }
    anyhow::Error::new(e)
}
