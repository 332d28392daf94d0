use clap::Parser;
use tracing_subscriber::EnvFilter;

use research_relay::cli::handlers::{self, RunParams};
use research_relay::cli::{Cli, Commands, ConfigCommands};
use research_relay::{Config, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so command output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("research_relay=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Login {
            user_id,
            email,
            access_token,
            refresh_token,
            expires_in,
        } => handlers::login(config, user_id, email, access_token, refresh_token, expires_in).await,
        Commands::Logout => handlers::logout(config).await,
        Commands::Whoami => handlers::whoami(config).await,
        Commands::Run {
            category,
            subject,
            urls,
            attachments,
            email,
            instructions,
            detach,
        } => {
            handlers::run_task(
                config,
                RunParams {
                    category,
                    subject,
                    urls,
                    attachments,
                    email,
                    instructions,
                    detach,
                },
            )
            .await
        }
        Commands::Watch { task_id } => handlers::watch(config, task_id).await,
        Commands::Cancel { task_id } => handlers::cancel(config, task_id).await,
        Commands::FollowUp {
            task_id,
            instruction,
            detach,
        } => handlers::follow_up(config, task_id, instruction, detach).await,
        Commands::History { command } => handlers::handle_history_command(config, command).await,
        Commands::Remote { limit } => handlers::list_remote(config, limit).await,
        Commands::Publish { task_id, private } => handlers::publish(config, task_id, private).await,
        Commands::Public { task_id } => handlers::show_public(config, task_id).await,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config),
            ConfigCommands::Path => handlers::show_config_path(),
            ConfigCommands::Init { force } => handlers::init_config(&config, force),
        },
    }
}
