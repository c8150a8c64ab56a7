//! Stagecraft CLI

use clap::{Arg, ArgAction, Command};
use stagecraft::{aws, crate_version};
use std::path::PathBuf;
use tracing::error;

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Entrypoint for the Stagecraft CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("stagecraft")
        .version(crate_version())
        .about("Provision staged container deployment topologies behind a TLS edge.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(aws::CMD)
                .about("Assemble stage topologies (network, trust groups, load balancer, certificates, distribution, and an auto-scaled container service) on AWS.")
                .subcommand(
                    Command::new(aws::CREATE_CMD)
                        .about("Assemble every stage topology from a YAML manifest.")
                        .arg(
                            Arg::new("config")
                                .long("config")
                                .required(true)
                                .help("Path to YAML manifest")
                                .value_parser(clap::value_parser!(PathBuf)),
                        )
                        .arg(
                            Arg::new("stage")
                                .long("stage")
                                .help("Assemble only the named stage")
                                .value_parser(clap::value_parser!(String)),
                        ),
                )
                .subcommand(
                    Command::new(aws::PLAN_CMD)
                        .about("Print the dependency-ordered build plan shared by every stage."),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    if let Some(aws_matches) = matches.subcommand_matches(aws::CMD) {
        match aws_matches.subcommand() {
            Some((aws::CREATE_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                let stage = matches.get_one::<String>("stage").map(|s| s.as_str());
                if let Err(e) = aws::create(config_path, stage).await {
                    error!(error=?e, "failed to assemble stage topologies");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((aws::PLAN_CMD, _)) => {
                aws::plan();
                return std::process::ExitCode::SUCCESS;
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
            }
            None => {
                error!("no subcommand provided");
            }
        }
    } else if let Some(cmd) = matches.subcommand_name() {
        error!(cmd, "invalid subcommand");
    } else {
        error!("no subcommand provided");
    }
    std::process::ExitCode::FAILURE
}
