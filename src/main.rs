mod args;
mod command;
mod config;
mod init;

use crate::config::config_holder::ConfigHolder;
use args::{Args, Server, Subcommand};
use clap::Parser;
use command::Opened;
use directories::{BaseDirs, ProjectDirs};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let project_dirs = ProjectDirs::from("com", "herald", "herald");
    let base_dirs = BaseDirs::new();
    let subcommand = match args.command {
        Subcommand::Server(Server::GenerateConfig { output, overwrite }) => {
            return ConfigHolder::generate_default_config(output, overwrite).await;
        }
        Subcommand::Server(Server::Run) => {
            let config_holder = ConfigHolder::new(project_dirs, base_dirs, args.config)?;
            return command::server::run(config_holder).await;
        }
        Subcommand::Server(Server::Verify) => {
            let config_holder = ConfigHolder::new(project_dirs, base_dirs, args.config)?;
            return command::server::verify(config_holder).await;
        }
        Subcommand::Operator(subcommand) => subcommand,
    };
    init::init_cli();
    let config_holder = ConfigHolder::new(project_dirs, base_dirs, args.config)?;
    let opened = Opened::new(&config_holder).await?;
    let res = command::operator(&opened, subcommand).await;
    opened.close().await;
    res
}
