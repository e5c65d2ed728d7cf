use clap::Parser;
use intervention_relay::catchup::HttpTarget;
use intervention_relay::config::{Cli, RelayConfig};
use intervention_relay::logging;
use intervention_relay::relay::{Relay, RelayContext};
use intervention_relay::scanner::CouchChanges;
use intervention_relay::sink::JsonLinesSink;
use intervention_relay::RelayError;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_subscriber(cli.log.as_deref(), cli.log_json);

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let RelayError::Config(_) = e {
                error!(event = "missing config", kind = e.kind(), error = %e);
            } else {
                error!(event = "fatal", kind = e.kind(), error = %e);
            }
            ExitCode::from(1)
        }
    }
}

async fn run(cli: &Cli) -> Result<(), RelayError> {
    let config = RelayConfig::from_cli(cli)?;
    info!(
        event = "starting",
        store = %config.store.path.display(),
        registry = %config.registry_url,
        track = %config.track_term(),
    );

    let ctx = RelayContext::open(&config.store)?;
    let _drain = logging::spawn_event_logger(&ctx.bus);

    let client = reqwest::Client::builder()
        .user_agent(concat!("intervention-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| RelayError::Config(format!("http client: {}", e)))?;

    let fetcher = HttpTarget::new(client.clone(), &config.registry_url);
    let source = CouchChanges::new(client, &config.registry_url, config.batch_size);
    let sink = JsonLinesSink::new(tokio::io::stdin());

    let relay = Relay::new(ctx, config)?;
    relay.run(&fetcher, Box::new(source), Box::new(sink)).await
}
