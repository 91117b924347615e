use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agentdeck::app::App;
use agentdeck_core::config::{Command, Config, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Config::parse_args();

    // Setup logging
    setup_logging(cli.debug);

    // Load settings
    let mut settings = Settings::load(cli.config.as_ref())?;
    settings.merge_cli(&cli);
    settings.validate();

    // Run the application
    let command = cli.command.clone().unwrap_or(Command::Watch);
    let mut app = App::new(settings, cli.team.clone());
    app.run(command).await
}

fn setup_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("agentdeck=debug,agentdeck_core=debug")
    } else {
        EnvFilter::new("agentdeck=info,agentdeck_core=info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
