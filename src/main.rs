use std::process::ExitCode;

use tracing::{error, info};

use scripthost::{Config, ScriptHost};

fn main() -> ExitCode {
    // Load configuration
    let mut config = match Config::load("scripthost.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load scripthost.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };
    config.apply_env_overrides();

    // Initialize logging
    if let Err(e) = scripthost::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        scripthost::logging::init_console_only(&config.logging.level);
    }

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: scripthost <script.lua> [function]");
        return ExitCode::from(2);
    };
    let function = args.next();

    match run(config, &path, function.as_deref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config, path: &str, function: Option<&str>) -> scripthost::Result<()> {
    config.validate()?;
    let code = std::fs::read_to_string(path)?;

    let mut host = ScriptHost::new(config.script)?;
    host.register_function("log", |args| {
        let message = args.get_string(0)?;
        info!(target: "script", "{}", message);
        Ok(0)
    })?;

    host.load(&code, path)?;
    info!(script = path, sandboxed = host.is_sandboxed(), "Script loaded");

    if let Some(function) = function {
        host.begin_call(function)?;
        let values = host.end_call()?;
        info!(function, results = ?values, "Call finished");
    }
    Ok(())
}
