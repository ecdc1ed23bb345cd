use clause_retriever::{CliError, logging};

fn is_robot_mode_args() -> bool {
    std::env::args().any(|arg| arg == "--json")
}

fn report_error(err: &CliError) -> ! {
    if is_robot_mode_args() {
        eprintln!("{}", err.to_json());
    } else {
        eprintln!("{err}");
    }
    std::process::exit(err.code);
}

fn main() -> anyhow::Result<()> {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    let raw_args: Vec<String> = std::env::args().collect();
    let parsed = match clause_retriever::parse_cli(raw_args) {
        Ok(parsed) => parsed,
        Err(err) => report_error(&err),
    };

    let logging_guard = match logging::init(&parsed.log_options()) {
        Ok(guard) => guard,
        Err(err) => report_error(&CliError::usage(format!("cannot initialize logging: {err}"))),
    };

    match clause_retriever::run_with_parsed(parsed) {
        Ok(()) => Ok(()),
        Err(err) => {
            // Flush file logs before exiting.
            drop(logging_guard);
            report_error(&err)
        }
    }
}
