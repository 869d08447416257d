use tracing::info;
use wisp::channel::ChannelRegistry;
use wisp::config::Config;
use wisp::{logging, runtime};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!(
        r#"Wisp v{VERSION} — lightweight personal AI-assistant runtime

USAGE:
    wisp <COMMAND>

COMMANDS:
    start       Start the runtime (bus, executor, memory, migration)
    version     Show version information
    help        Show this help message

CONFIG FILE (wisp.config.yaml):
    Wisp reads configuration from wisp.config.yaml (or wisp.config.yml).
    Override the path with the WISP_CONFIG env var. `${{VAR}}` values are
    expanded from the environment.

    Core fields:
      agents.workspace             Tool working directory
      agents.models.chat           Default chat model (<provider>/<model>)
      agents.models.intent         Intent pre-pass model (optional)
      agents.models.embed          Embedding model (optional)
      agents.max_tool_iterations   ReAct loop bound (default: 20)
      agents.auto                  Enable the adaptive router
      agents.max                   Prefer the highest capability tier

    providers.<name>:
      base_url                     OpenAI-compatible endpoint
      api_key                      Bearer token (optional)
      priority                     Failover order, lower first
      models                       Served models/patterns ("*" = any)

    routing:                       Rules and complexity weights
    memory:                        Storage path, retention, multi-embed

EXAMPLES:
    wisp start          Start the runtime
    wisp version        Show version
    wisp help           Show this message"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str());

    match command {
        Some("start") => {}
        Some("version" | "--version" | "-V") => {
            println!("wisp {VERSION}");
            return Ok(());
        }
        Some("help" | "--help" | "-h") | None => {
            print_help();
            return Ok(());
        }
        Some(unknown) => {
            eprintln!("Unknown command: {unknown}\n");
            print_help();
            std::process::exit(1);
        }
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    if std::env::var("WISP_GATEWAY").is_ok() {
        logging::init_logging(&config.memory.storage_path)?;
    } else {
        logging::init_console_logging();
    }

    info!("Starting Wisp v{VERSION}");

    // Channel adapters are external: embedders register theirs here
    // before handing the registry to the runtime.
    let channels = ChannelRegistry::new();
    runtime::run(config, channels).await
}
