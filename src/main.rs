/*!
 * Executable entrypoint for the block orchestrator API server
 *
 * Usage: `block-orchestrator CONFIG_FILE [--openapi]`.  With `--openapi`
 * the OpenAPI description is printed to stdout instead of starting the
 * server.  Bad arguments exit 2; runtime failures exit 1.
 */

use block_orchestrator::api_config::ApiServerConfig;
use block_orchestrator::server::run_openapi;
use block_orchestrator::server::run_server;
use std::path::Path;
use std::process::exit;

const USAGE: &str = "usage: block-orchestrator CONFIG_FILE [--openapi]";
const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let (config_path, openapi) = match args.len() {
        2 => (&args[1], false),
        3 if args[2] == "--openapi" => (&args[1], true),
        _ => fatal(USAGE, EXIT_USAGE),
    };

    let config = match ApiServerConfig::from_file(Path::new(config_path)) {
        Ok(config) => config,
        Err(message) => fatal(&message, EXIT_FAILURE),
    };

    let result = if openapi {
        run_openapi()
    } else {
        run_server(&config).await
    };
    if let Err(message) = result {
        fatal(&message, EXIT_FAILURE);
    }
}

/**
 * Prints a fatal error prefixed with the program name and exits with the
 * given code.
 */
fn fatal(message: &str, code: i32) -> ! {
    let arg0: Option<String> = std::env::args().next();
    let program = arg0
        .as_deref()
        .map(Path::new)
        .and_then(|p| p.file_name())
        .and_then(|f| f.to_str())
        .unwrap_or("block-orchestrator");
    eprintln!("{}: {}", program, message);
    exit(code);
}
