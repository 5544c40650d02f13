use adflow_core::pipeline::{self, CREATIVE_CAMPAIGN};
use adflow_core::prelude::*;
use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("adflow")
        .version(adflow_core::VERSION)
        .about("Workflow engine for AI ad-creative pipelines")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration file (TOML)"),
        )
        .subcommand(
            Command::new("validate")
                .about("Validate the configuration and the built-in definitions"),
        )
        .subcommand(
            Command::new("demo")
                .about("Run the creative pipeline against simulated agents")
                .arg(
                    Arg::new("product")
                        .long("product")
                        .default_value("trail running shoes")
                        .help("Product the campaign is for"),
                )
                .arg(
                    Arg::new("reject-first")
                        .long("reject-first")
                        .action(ArgAction::SetTrue)
                        .help("Reject the first review to exercise the rework loop"),
                ),
        )
        .subcommand(
            Command::new("show-config").about("Print the effective configuration as TOML"),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<EngineConfig> {
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn demo(config: EngineConfig, product: &str, reject_first: bool) -> anyhow::Result<()> {
    let engine = Arc::new(WorkflowEngine::from_config(config)?);
    let client = Arc::new(SimulatedAgentClient::new());
    let service = WorkflowService::with_builtin(engine, client)?;

    let input = json!({ "product": product, "brand": "adflow demo", "audience": "weekend runners" });
    let run = service
        .create_run(&CREATIVE_CAMPAIGN.into(), input, vec![])
        .await?;
    info!(run_id = %run.id, "demo run created");

    let mut run = service.start(run.id).await?;
    let mut rejected = false;
    while run.status == RunStatus::Interrupted {
        let (decision, note) = if reject_first && !rejected {
            rejected = true;
            (ApprovalDecision::Reject, Some("make the headline punchier".to_string()))
        } else {
            (ApprovalDecision::Approve, None)
        };
        info!(run_id = %run.id, %decision, "auto-review");
        run = service.resume(run.id, decision, note).await?;
    }

    println!("{}", serde_json::to_string_pretty(&run)?);
    if run.status != RunStatus::Completed {
        anyhow::bail!("demo run ended {}", run.status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("validate", _)) => {
            let registry = pipeline::creative_campaign(Arc::new(SimulatedAgentClient::new()))?;
            registry.validate()?;
            println!(
                "ok: config valid, `{}` has {} steps",
                registry.definition_id(),
                registry.len()
            );
            for step in registry.steps() {
                let kind = if step.is_approval() { "approval" } else { "task" };
                println!("  {:<12} {:<8} {}", step.id.as_str(), kind, step.name);
            }
        }
        Some(("demo", args)) => {
            let product = args
                .get_one::<String>("product")
                .map_or("trail running shoes", String::as_str);
            demo(config, product, args.get_flag("reject-first")).await?;
        }
        Some(("show-config", _)) => {
            print!("{}", config.to_toml_string()?);
        }
        _ => unreachable!("subcommand_required"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn config_flag_is_global() {
        let matches = cli()
            .try_get_matches_from(["adflow", "demo", "--reject-first", "--config", "engine.toml"])
            .unwrap();
        assert_eq!(
            matches.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("engine.toml"))
        );
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "demo");
        assert!(args.get_flag("reject-first"));
    }
}
